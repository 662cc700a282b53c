/// A 32-bit postgres object identifier.
pub type Oid = u32;

/// The zero OID: let the server infer the parameter type.
pub const UNSPECIFIED: Oid = 0;
