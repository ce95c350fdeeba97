use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound on [`BrowserMemory::recent_pages`].
pub const MAX_RECENT_PAGES: usize = 20;

/// Characters of page text forwarded to the model per turn.
const PROMPT_TEXT_BUDGET: usize = 8_000;
const PROMPT_LINK_BUDGET: usize = 40;

/// Snapshot of the page the user is looking at. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub text_content: String,
    #[serde(default)]
    pub links: Vec<PageLink>,
    #[serde(default)]
    pub images: Vec<PageImage>,
    #[serde(default)]
    pub forms: Vec<PageForm>,
    #[serde(default)]
    pub metadata: PageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLink {
    pub text: String,
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    pub alt: String,
    pub src: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageForm {
    pub id: String,
    pub action: String,
    pub inputs: Vec<FormInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormInput {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub device_pixel_ratio: f64,
}

impl PageContext {
    /// Render the page as system-instruction text for the model.
    pub fn to_prompt_section(&self) -> String {
        let mut section = String::new();
        section.push_str("You are operating inside the user's web browser.\n");
        section.push_str(&format!("Current page: {}\nURL: {}\n", self.title, self.url));

        if let Some(description) = self.metadata.description.as_deref() {
            if !description.trim().is_empty() {
                section.push_str(&format!("Description: {}\n", description.trim()));
            }
        }
        if let Some(viewport) = &self.viewport {
            section.push_str(&format!(
                "Viewport: {}x{} at scroll ({}, {}), pixel ratio {}\n",
                viewport.width,
                viewport.height,
                viewport.scroll_x,
                viewport.scroll_y,
                viewport.device_pixel_ratio
            ));
        }

        if !self.links.is_empty() {
            section.push_str("\nLinks:\n");
            for link in self.links.iter().take(PROMPT_LINK_BUDGET) {
                section.push_str(&format!("- [{}]({})\n", link.text.trim(), link.href));
            }
        }

        if !self.forms.is_empty() {
            section.push_str("\nForms:\n");
            for form in &self.forms {
                let inputs = form
                    .inputs
                    .iter()
                    .map(|input| format!("{} ({})", input.name, input.input_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                section.push_str(&format!("- #{} -> {}: {}\n", form.id, form.action, inputs));
            }
        }

        let text = self.text_content.trim();
        if !text.is_empty() {
            section.push_str("\nPage text:\n");
            section.push_str(truncate_chars(text, PROMPT_TEXT_BUDGET));
            section.push('\n');
        }
        section
    }
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitedPage {
    pub url: String,
    pub title: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// Per-browser memory shared by every conversation.
///
/// The core only ever appends visits; preferences and session data belong to
/// the host and are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserMemory {
    pub recent_pages: VecDeque<VisitedPage>,
    #[serde(default)]
    pub user_preferences: Map<String, Value>,
    #[serde(default)]
    pub session_data: Map<String, Value>,
}

impl BrowserMemory {
    /// Append a visit. Repeated visits to the current URL refresh the newest
    /// entry instead of growing the list.
    pub fn record_visit(&mut self, page: &PageContext, timestamp: i64) {
        if self
            .recent_pages
            .back()
            .is_some_and(|last| last.url == page.url)
        {
            self.recent_pages.pop_back();
        }

        self.recent_pages.push_back(VisitedPage {
            url: page.url.clone(),
            title: page.title.clone(),
            timestamp,
        });

        while self.recent_pages.len() > MAX_RECENT_PAGES {
            self.recent_pages.pop_front();
        }
    }

    pub fn last_visit(&self) -> Option<&VisitedPage> {
        self.recent_pages.back()
    }
}
