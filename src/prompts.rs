//! Prompts for the channel persona analysis.
//!
//! The default prompt lives here so it can be inspected in tests and swapped
//! through [`crate::config::AnalysisOptions::prompt`] without touching the
//! analyzer.

use crate::pipeline::extract::ExtractedDocument;

/// System turn framing every analysis request.
pub const SYSTEM_PROMPT: &str = "You are an audience research analyst. You study screenshots of \
YouTube channel pages and describe who watches the channel, grounded strictly in what the page shows.";

/// Default instruction sent with the ordered tiles of one channel page.
pub const DEFAULT_ANALYSIS_PROMPT: &str = r#"The attached images are consecutive slices of one YouTube channel page, top to bottom. Neighbouring slices overlap slightly; do not count content twice.

Using only what is visible (channel name, banner, description, video titles, thumbnails, view counts and upload dates), describe the channel's audience persona in Markdown with these sections:

## Channel Summary
## Content Themes
## Audience Persona
- Demographics (age range, occupation, region, language)
- Interests and motivations
- Pain points the channel addresses
## Engagement Signals
## Recommendations

Be concrete and cite the titles or numbers you relied on. If something cannot be determined from the page, say so instead of guessing. Output only the Markdown report."#;

/// Render extracted documents as an extra prompt section.
///
/// Returns an empty string when there is nothing to add.
pub fn document_context(documents: &[ExtractedDocument]) -> String {
    if documents.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "\n\nAdditional context documents follow. Use them to refine the persona.\n",
    );
    for doc in documents {
        out.push_str(&format!(
            "\n--- BEGIN {name} ---\n{text}\n--- END {name} ---\n",
            name = doc.name(),
            text = doc.text.trim_end(),
        ));
    }
    out
}

/// Full user-turn text: base prompt plus any document context.
pub fn analysis_prompt(base: Option<&str>, documents: &[ExtractedDocument]) -> String {
    let mut prompt = base.unwrap_or(DEFAULT_ANALYSIS_PROMPT).to_string();
    prompt.push_str(&document_context(documents));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_prompt_mentions_slices_and_persona() {
        assert!(DEFAULT_ANALYSIS_PROMPT.contains("top to bottom"));
        assert!(DEFAULT_ANALYSIS_PROMPT.contains("## Audience Persona"));
    }

    #[test]
    fn no_documents_no_context() {
        assert_eq!(document_context(&[]), "");
        assert_eq!(analysis_prompt(Some("custom"), &[]), "custom");
    }

    #[test]
    fn documents_are_delimited_by_name() {
        let docs = vec![ExtractedDocument {
            path: PathBuf::from("/tmp/brief.txt"),
            text: "Launch in Q3\n".into(),
            supported: true,
        }];
        let prompt = analysis_prompt(None, &docs);
        assert!(prompt.starts_with(DEFAULT_ANALYSIS_PROMPT));
        assert!(prompt.contains("--- BEGIN brief.txt ---\nLaunch in Q3\n--- END brief.txt ---"));
    }
}
