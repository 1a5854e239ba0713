//! Text cleanup helpers shared by the agents and the session store.
//!
//! Search documents and LLM responses occasionally carry HTML `<br>` tags
//! that break markdown rendering downstream; these helpers scrub them.

use once_cell::sync::Lazy;
use regex::Regex;

static BR_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static DOUBLED_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*,").unwrap());
static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r" +").unwrap());
static SPACED_NEWLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r" *\n *").unwrap());

/// Removes HTML tags from a value pulled out of a search document.
///
/// `<br>` variants become ", ", every other tag is dropped, and doubled
/// commas left behind by the substitution are collapsed.
pub fn clean_html_tags(text: &str) -> String {
    let text = BR_TAG.replace_all(text, ", ");
    let text = ANY_TAG.replace_all(&text, "");
    let text = DOUBLED_COMMA.replace_all(&text, ",");
    text.trim().to_string()
}

/// Scrubs HTML from an LLM response while preserving newlines.
///
/// Markdown tables depend on line structure, so only runs of spaces are
/// collapsed; newlines survive.
pub fn strip_html_keep_newlines(text: &str) -> String {
    let text = BR_TAG.replace_all(text, ", ");
    let text = ANY_TAG.replace_all(&text, "");
    let text = DOUBLED_COMMA.replace_all(&text, ",");
    let text = MULTI_SPACE.replace_all(&text, " ");
    let text = SPACED_NEWLINE.replace_all(&text, "\n");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_br_variants() {
        assert_eq!(clean_html_tags("I10<br>E11.9<br/>I50"), "I10, E11.9, I50");
        assert_eq!(clean_html_tags("a<BR />b"), "a, b");
    }

    #[test]
    fn test_clean_strips_other_tags() {
        assert_eq!(clean_html_tags("<b>bold</b> text"), "bold text");
    }

    #[test]
    fn test_clean_collapses_doubled_commas() {
        assert_eq!(clean_html_tags("a<br>,b"), "a,b");
    }

    #[test]
    fn test_strip_preserves_table_rows() {
        let input = "| Code | Name |\n|  I10  | Hypertension<br>primary |";
        let cleaned = strip_html_keep_newlines(input);
        assert!(cleaned.contains('\n'));
        assert!(cleaned.contains("Hypertension, primary"));
        assert!(!cleaned.contains("<br>"));
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(clean_html_tags("no markup here"), "no markup here");
    }
}
