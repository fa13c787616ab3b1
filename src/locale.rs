//! Minimal positional-substitution formatter for operator-facing strings.
//!
//! The original agent formats localized strings with `{1}`, `{2}`, …
//! placeholders (`leatherman::locale::format`). This crate keeps that
//! convention for `execution_error` and PXPError descriptions so the wording
//! stays close to upstream, without pulling in a full i18n stack.

/// Substitute `{1}`, `{2}`, … placeholders in `template` with `args` in order.
///
/// Unknown placeholders and extra arguments are left as-is / ignored.
///
/// # Examples
/// ```
/// use pxa::locale::format_msg;
/// assert_eq!(
///     format_msg("Executable '{1}' failed to run: {2}", &["ls", "not found"]),
///     "Executable 'ls' failed to run: not found"
/// );
/// ```
#[must_use]
pub fn format_msg(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if ch != '{' {
            out.push(ch);
            continue;
        }
        let mut digits = String::new();
        while let Some((_, d)) = chars.peek() {
            if d.is_ascii_digit() {
                digits.push(*d);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() || chars.peek().map(|(_, c)| *c) != Some('}') {
            out.push('{');
            out.push_str(&digits);
            continue;
        }
        chars.next();
        match digits.parse::<usize>() {
            Ok(index) if index >= 1 && index <= args.len() => out.push_str(args[index - 1]),
            _ => {
                out.push('{');
                out.push_str(&digits);
                out.push('}');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::format_msg;

    #[test]
    fn substitutes_in_order() {
        assert_eq!(format_msg("{1} and {2}", &["a", "b"]), "a and b");
    }

    #[test]
    fn leaves_unmatched_placeholder() {
        assert_eq!(format_msg("{1} {3}", &["a", "b"]), "a {3}");
    }

    #[test]
    fn handles_no_placeholders() {
        assert_eq!(format_msg("plain text", &[]), "plain text");
    }
}
