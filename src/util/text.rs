use std::borrow::Cow;

/// Flattens feed-supplied text onto a single terminal line.
///
/// Runs of whitespace (including newlines and tabs) collapse to one space and
/// every other control character, including the ESC that starts a terminal
/// escape sequence, is dropped. Clean single-line input is returned borrowed.
///
/// # Examples
///
/// ```
/// use gleaner::util::one_line;
///
/// assert_eq!(one_line("Hello\n  world"), "Hello world");
/// assert_eq!(one_line("Evil\x1b Feed"), "Evil Feed");
/// ```
pub fn one_line(s: &str) -> Cow<'_, str> {
    let trimmed = s.trim();
    let clean = !trimmed.chars().any(char::is_control) && !trimmed.contains("  ");
    if clean {
        return Cow::Borrowed(trimmed);
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut pending_space = false;
    for c in trimmed.chars() {
        if c.is_whitespace() {
            pending_space = true;
        } else if !c.is_control() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_borrowed() {
        let result = one_line("Plain title");
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(result, "Plain title");
    }

    #[test]
    fn test_newlines_and_tabs_collapse() {
        assert_eq!(one_line("  a\n\tb   c  "), "a b c");
    }

    #[test]
    fn test_control_chars_dropped() {
        assert_eq!(one_line("bell\x07 ring"), "bell ring");
        assert_eq!(one_line("\x1b[31mred"), "[31mred");
    }

    #[test]
    fn test_empty() {
        assert_eq!(one_line("   "), "");
    }
}
