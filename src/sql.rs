//! SQL statement splitting and parameter placeholder scanning.
//!
//! Breaks a query string into statements at top-level `;`, and each
//! statement into text fragments separated by `?` placeholders. Quoted
//! regions, comments and dollar quotes are skipped; invalid SQL is not an
//! error here, the backend gets to reject it.

/// Fragment arrays per statement.
///
/// `"a ? b; c"` with parameters scans to `[["a ", " b"], ["c"]]`.
pub(crate) fn split_statements(
    sql: &str,
    with_parameters: bool,
    standard_conforming_strings: bool,
) -> Vec<Vec<String>> {
    let chars = sql.as_bytes();
    let mut statements = Vec::new();
    let mut fragments: Vec<String> = Vec::with_capacity(15);

    let mut fragment_start = 0;
    let mut in_paren = 0i32;
    let mut i = 0;

    // All scan triggers are ascii, and utf8 continuation bytes are >= 0x80,
    // so byte-wise scanning never slices inside a multi-byte char.
    while i < chars.len() {
        match chars[i] {
            b'\'' => i = parse_single_quotes(chars, i, standard_conforming_strings),
            b'"' => i = parse_double_quotes(chars, i),
            b'-' => i = parse_line_comment(chars, i),
            b'/' => i = parse_block_comment(chars, i),
            b'$' => i = parse_dollar_quotes(chars, i),
            b'(' => in_paren += 1,
            b')' => in_paren -= 1,
            b'?' if with_parameters => {
                fragments.push(sql[fragment_start..i].to_owned());
                fragment_start = i + 1;
            }
            b';' if in_paren == 0 => {
                fragments.push(sql[fragment_start..i].to_owned());
                fragment_start = i + 1;
                if fragments.len() > 1 || !fragments[0].trim().is_empty() {
                    statements.push(std::mem::take(&mut fragments));
                } else {
                    fragments.clear();
                }
            }
            _ => {}
        }
        i += 1;
    }

    fragments.push(sql.get(fragment_start..).unwrap_or("").to_owned());
    if fragments.len() > 1 || !fragments[0].trim().is_empty() {
        statements.push(fragments);
    }

    statements
}

/// Skip a single-quoted literal, returning the index of the closing quote.
///
/// With standard_conforming_strings off, a backslash escapes the next
/// character; `''` doubling is internal either way.
fn parse_single_quotes(chars: &[u8], offset: usize, standard_conforming_strings: bool) -> usize {
    let mut i = offset + 1;
    while i < chars.len() {
        match chars[i] {
            b'\\' if !standard_conforming_strings => i += 2,
            b'\'' => {
                if chars.get(i + 1) == Some(&b'\'') {
                    i += 2;
                } else {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    chars.len()
}

/// Skip a double-quoted identifier; only `""` doubling is internal.
fn parse_double_quotes(chars: &[u8], offset: usize) -> usize {
    let mut i = offset + 1;
    while i < chars.len() {
        if chars[i] == b'"' {
            if chars.get(i + 1) == Some(&b'"') {
                i += 2;
            } else {
                return i;
            }
        } else {
            i += 1;
        }
    }
    chars.len()
}

/// Skip a `--` comment to end of line; a lone `-` is not special.
fn parse_line_comment(chars: &[u8], offset: usize) -> usize {
    if chars.get(offset + 1) != Some(&b'-') {
        return offset;
    }
    let mut i = offset + 2;
    while i < chars.len() && chars[i] != b'\n' {
        i += 1;
    }
    i
}

/// Skip a `/* */` comment; nesting is not supported. A lone `/` is not special.
fn parse_block_comment(chars: &[u8], offset: usize) -> usize {
    if chars.get(offset + 1) != Some(&b'*') {
        return offset;
    }
    let mut i = offset + 2;
    while i + 1 < chars.len() {
        if chars[i] == b'*' && chars[i + 1] == b'/' {
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Skip a `$tag$ ... $tag$` quoted block, returning the index of the last
/// `$` of the closing delimiter. A `$` that does not open a valid tag is
/// not special.
fn parse_dollar_quotes(chars: &[u8], offset: usize) -> usize {
    let Some(tag_end) = dollar_tag_end(chars, offset) else {
        return offset;
    };

    let delimiter = &chars[offset..=tag_end];
    let mut i = tag_end + 1;
    while i + delimiter.len() <= chars.len() {
        if &chars[i..i + delimiter.len()] == delimiter {
            return i + delimiter.len() - 1;
        }
        i += 1;
    }
    chars.len()
}

/// The index of the closing `$` of a valid opening tag, if any.
///
/// A tag is identifier-like: empty (`$$`) or an underscore/alphanumeric
/// run not starting with a digit.
fn dollar_tag_end(chars: &[u8], offset: usize) -> Option<usize> {
    if matches!(chars.get(offset + 1), Some(b'0'..=b'9')) {
        return None;
    }
    let mut i = offset + 1;
    while i < chars.len() {
        match chars[i] {
            b'$' => return Some(i),
            b'_' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' => i += 1,
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::split_statements;

    fn statements(sql: &str) -> Vec<Vec<String>> {
        split_statements(sql, true, true)
    }

    #[test]
    fn statement_count() {
        assert_eq!(statements("SELECT 1; SELECT 2; SELECT 3").len(), 3);
        assert_eq!(statements("SELECT 1").len(), 1);
        assert_eq!(statements("").len(), 0);
        assert_eq!(statements("   ;  ").len(), 0);
        assert_eq!(statements("SELECT ';'; SELECT 2").len(), 2);
    }

    #[test]
    fn round_trip_without_placeholders() {
        let sql = "SELECT a, 'b;?', \"c?\" FROM t WHERE d = $x$?;$x$ -- ?\n";
        let stmts = statements(sql);
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].concat(), sql);
    }

    #[test]
    fn round_trip_with_placeholders() {
        let sql = "INSERT INTO t VALUES (?, ?, ?)";
        let stmts = statements(sql);
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].len(), 4);
        assert_eq!(stmts[0].join("?"), sql);
    }

    #[test]
    fn dollar_quotes() {
        assert_eq!(statements("SELECT $tag$;$tag$; SELECT 2").len(), 2);
        assert_eq!(statements("SELECT $$;'\";$$; SELECT 2").len(), 2);
        // bare dollar is not special
        assert_eq!(statements("SELECT 4$; SELECT 2").len(), 2);
    }

    #[test]
    fn placeholder_isolation() {
        for sql in [
            "SELECT '?'",
            "SELECT \"?\"",
            "SELECT 1 -- ?\n",
            "SELECT /* ? */ 1",
            "SELECT $q$?$q$",
        ] {
            assert_eq!(statements(sql)[0].len(), 1, "split inside quoted region: {sql}");
        }
        assert_eq!(statements("SELECT ?")[0].len(), 2);
    }

    #[test]
    fn semicolon_in_parens() {
        // a paren-depth tracker keeps procedure-ish bodies whole
        assert_eq!(statements("SELECT f(1); SELECT 2").len(), 2);
    }

    #[test]
    fn backslash_escapes() {
        // standard_conforming_strings off: backslash escapes the quote
        let stmts = split_statements(r"SELECT '\'?'; SELECT 2", true, false);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].len(), 1);

        // standard_conforming_strings on: the backslash is literal and the
        // second quote closes the string
        let stmts = split_statements(r"SELECT '\'?", true, true);
        assert_eq!(stmts[0].len(), 2);
    }

    #[test]
    fn quote_doubling() {
        let stmts = statements("SELECT 'it''s; fine'; SELECT 2");
        assert_eq!(stmts.len(), 2);
        let stmts = statements(r#"SELECT "a""b;" FROM t"#);
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn unterminated_regions() {
        // scanner never fails, the backend reports the syntax error
        assert_eq!(statements("SELECT 'abc").len(), 1);
        assert_eq!(statements("SELECT /* abc").len(), 1);
        assert_eq!(statements("SELECT $x$ abc").len(), 1);
    }
}
