use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};
use trawl_core::error::AppError;
use trawl_core::models::{Record, Target};
use trawl_core::traits::RecordExtractor;

/// Columns produced by [`ProjectPageExtractor`], in output order.
pub const PROJECT_FIELDS: [&str; 5] = [
    "name",
    "description",
    "canonical_url",
    "stars",
    "language",
];

struct Selectors {
    og_title: Selector,
    og_description: Selector,
    og_url: Selector,
    meta_description: Selector,
    repo_name: Selector,
    title: Selector,
    stars_counter: Selector,
    stargazers_link: Selector,
    language: Selector,
    language_bar: Selector,
}

impl Selectors {
    fn compile() -> Result<Self, AppError> {
        Ok(Self {
            og_title: parse(r#"meta[property="og:title"]"#)?,
            og_description: parse(r#"meta[property="og:description"]"#)?,
            og_url: parse(r#"meta[property="og:url"]"#)?,
            meta_description: parse(r#"meta[name="description"]"#)?,
            repo_name: parse(r#"strong[itemprop="name"] a"#)?,
            title: parse("title")?,
            stars_counter: parse("#repo-stars-counter-star")?,
            stargazers_link: parse(r#"a[href$="/stargazers"] strong"#)?,
            language: parse(r#"[itemprop="programmingLanguage"]"#)?,
            language_bar: parse("span.color-fg-default.text-bold.mr-1")?,
        })
    }
}

fn parse(selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector)
        .map_err(|e| AppError::ConfigError(format!("Invalid selector '{selector}': {e}")))
}

/// Extracts project metadata from a repository page.
///
/// Open Graph tags are preferred; visible page elements are the fallback.
/// Every record carries all of [`PROJECT_FIELDS`], empty when absent, so
/// the output header stays fixed for a run.
#[derive(Clone)]
pub struct ProjectPageExtractor {
    selectors: Arc<Selectors>,
}

impl ProjectPageExtractor {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            selectors: Arc::new(Selectors::compile()?),
        })
    }

    fn name(&self, doc: &Html) -> Option<String> {
        let s = &self.selectors;
        meta_content(doc, &s.og_title)
            .map(|t| clean_title(&t))
            .or_else(|| first_text(doc, &s.repo_name))
            .or_else(|| first_text(doc, &s.title).map(|t| clean_title(&t)))
            .filter(|name| !name.is_empty())
    }

    fn stars(&self, doc: &Html) -> Option<String> {
        let s = &self.selectors;
        doc.select(&s.stars_counter)
            .next()
            .and_then(|el| {
                el.value()
                    .attr("title")
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .or_else(|| text_of(el))
            })
            .or_else(|| first_text(doc, &s.stargazers_link))
    }
}

impl RecordExtractor for ProjectPageExtractor {
    fn extract(&self, target: &Target, raw_content: &str) -> Result<Record, AppError> {
        let doc = Html::parse_document(raw_content);
        let s = &self.selectors;

        let name = self.name(&doc).ok_or_else(|| {
            AppError::ExtractionError(format!("no project title found for {}", target.key()))
        })?;

        let description = meta_content(&doc, &s.og_description)
            .or_else(|| meta_content(&doc, &s.meta_description))
            .unwrap_or_default();
        let url = meta_content(&doc, &s.og_url).unwrap_or_else(|| target.url().to_string());
        let stars = self.stars(&doc).unwrap_or_default();
        let language = first_text(&doc, &s.language)
            .or_else(|| first_text(&doc, &s.language_bar))
            .unwrap_or_default();

        Ok(Record::new(target, raw_content)
            .with_field("name", name)
            .with_field("description", description)
            .with_field("canonical_url", url)
            .with_field("stars", stars)
            .with_field("language", language))
    }
}

fn meta_content(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .filter_map(|el| el.value().attr("content"))
        .map(|c| c.trim().to_string())
        .find(|c| !c.is_empty())
}

fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector).find_map(text_of)
}

fn text_of(el: ElementRef<'_>) -> Option<String> {
    let text = el.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// "GitHub - owner/repo: A description" -> "owner/repo"
fn clean_title(raw: &str) -> String {
    let title = raw.trim();
    let title = title.strip_prefix("GitHub - ").unwrap_or(title);
    let title = title.split(": ").next().unwrap_or(title);
    let title = title.split(" · ").next().unwrap_or(title);
    title.trim().to_string()
}
