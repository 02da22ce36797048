use once_cell::sync::Lazy;
use regex::Regex;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<.*?>").expect("valid regex"));

/// Removes anything that looks like a markup tag. Entities and whitespace are
/// left as they are.
pub fn strip_html(text: &str) -> String {
    TAG.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_tags_keeps_entities() {
        assert_eq!(
            strip_html("<b>Breaking</b> news &amp; views"),
            "Breaking news &amp; views"
        );
    }

    #[test]
    fn test_self_closing_and_attributes() {
        assert_eq!(
            strip_html(r#"line<br/>next <img src="a.png" alt="x"> <a href="/x">link</a>"#),
            "linenext  link"
        );
    }

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(strip_html("no markup here"), "no markup here");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn test_unclosed_bracket_is_kept() {
        assert_eq!(strip_html("a < b and c"), "a < b and c");
    }

    #[test]
    fn test_non_greedy() {
        assert_eq!(strip_html("<p>one</p><p>two</p>"), "onetwo");
    }

    #[test]
    fn test_whitespace_not_normalized() {
        assert_eq!(strip_html("<p>\n  text  \n</p>"), "\n  text  \n");
    }
}
