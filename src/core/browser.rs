//! Local browser actions the model can call.
//!
//! Each action has a fixed name, a declaration advertised to the model and a
//! subset of [`BrowserActionParams`] it accepts. Execution happens in the
//! host's content script behind [`BrowserActionExecutor`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::api::FunctionDeclaration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserAction {
    Click,
    Type,
    Scroll,
    Navigate,
    Wait,
    Screenshot,
    ReadPage,
    PressKey,
    KeyCombination,
    Hover,
    DragAndDrop,
    GoBack,
    GoForward,
    ClickAt,
    TypeTextAt,
    ScrollAt,
}

impl BrowserAction {
    pub const ALL: [BrowserAction; 16] = [
        BrowserAction::Click,
        BrowserAction::Type,
        BrowserAction::Scroll,
        BrowserAction::Navigate,
        BrowserAction::Wait,
        BrowserAction::Screenshot,
        BrowserAction::ReadPage,
        BrowserAction::PressKey,
        BrowserAction::KeyCombination,
        BrowserAction::Hover,
        BrowserAction::DragAndDrop,
        BrowserAction::GoBack,
        BrowserAction::GoForward,
        BrowserAction::ClickAt,
        BrowserAction::TypeTextAt,
        BrowserAction::ScrollAt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BrowserAction::Click => "click",
            BrowserAction::Type => "type",
            BrowserAction::Scroll => "scroll",
            BrowserAction::Navigate => "navigate",
            BrowserAction::Wait => "wait",
            BrowserAction::Screenshot => "screenshot",
            BrowserAction::ReadPage => "read_page",
            BrowserAction::PressKey => "press_key",
            BrowserAction::KeyCombination => "key_combination",
            BrowserAction::Hover => "hover",
            BrowserAction::DragAndDrop => "drag_and_drop",
            BrowserAction::GoBack => "go_back",
            BrowserAction::GoForward => "go_forward",
            BrowserAction::ClickAt => "click_at",
            BrowserAction::TypeTextAt => "type_text_at",
            BrowserAction::ScrollAt => "scroll_at",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn description(self) -> &'static str {
        match self {
            BrowserAction::Click => "Click an element identified by a CSS selector or by viewport coordinates.",
            BrowserAction::Type => "Type text into an input identified by a CSS selector.",
            BrowserAction::Scroll => "Scroll the page or a scrollable element in a direction.",
            BrowserAction::Navigate => "Open a URL in the current tab.",
            BrowserAction::Wait => "Wait for the page to settle.",
            BrowserAction::Screenshot => "Capture a screenshot of the visible viewport.",
            BrowserAction::ReadPage => "Read the text content of the page or of one element.",
            BrowserAction::PressKey => "Press a single key, optionally focused on an element.",
            BrowserAction::KeyCombination => "Press a key combination such as Control+L.",
            BrowserAction::Hover => "Move the pointer over an element or coordinate.",
            BrowserAction::DragAndDrop => "Drag from one viewport coordinate to another.",
            BrowserAction::GoBack => "Go back in the tab history.",
            BrowserAction::GoForward => "Go forward in the tab history.",
            BrowserAction::ClickAt => "Click at viewport coordinates.",
            BrowserAction::TypeTextAt => "Click at viewport coordinates and type text there.",
            BrowserAction::ScrollAt => "Scroll at viewport coordinates in a direction.",
        }
    }

    /// Parameter keys the action accepts; everything else is dropped.
    pub fn param_keys(self) -> &'static [&'static str] {
        match self {
            BrowserAction::Click | BrowserAction::Hover => {
                &["selector", "target", "x", "y", "coordinate"]
            }
            BrowserAction::Type => &["selector", "target", "text", "value", "press_enter", "clear_before_typing"],
            BrowserAction::Scroll => &["direction", "amount", "selector", "target"],
            BrowserAction::Navigate => &["address", "uri", "url"],
            BrowserAction::Wait => &["seconds", "milliseconds"],
            BrowserAction::Screenshot | BrowserAction::GoBack | BrowserAction::GoForward => &[],
            BrowserAction::ReadPage => &["selector"],
            BrowserAction::PressKey => &["key", "selector"],
            BrowserAction::KeyCombination => &["keys"],
            BrowserAction::DragAndDrop => &["x", "y", "destination_x", "destination_y"],
            BrowserAction::ClickAt => &["x", "y"],
            BrowserAction::TypeTextAt => &["x", "y", "text", "press_enter", "clear_before_typing"],
            BrowserAction::ScrollAt => &["x", "y", "direction", "magnitude"],
        }
    }

    /// Each inner group needs at least one of its options present. An option
    /// written `x+y` needs every key it joins.
    fn required_groups(self) -> &'static [&'static [&'static str]] {
        match self {
            BrowserAction::Click | BrowserAction::Hover => &[&["selector", "target", "coordinate", "x+y"]],
            BrowserAction::Type => &[&["selector", "target"], &["text", "value"]],
            BrowserAction::Scroll => &[&["direction"]],
            BrowserAction::Navigate => &[&["address", "uri", "url"]],
            BrowserAction::PressKey => &[&["key"]],
            BrowserAction::KeyCombination => &[&["keys"]],
            BrowserAction::DragAndDrop => &[&["x"], &["y"], &["destination_x"], &["destination_y"]],
            BrowserAction::ClickAt => &[&["x"], &["y"]],
            BrowserAction::TypeTextAt => &[&["x"], &["y"], &["text"]],
            BrowserAction::ScrollAt => &[&["x"], &["y"], &["direction"]],
            BrowserAction::Wait
            | BrowserAction::Screenshot
            | BrowserAction::ReadPage
            | BrowserAction::GoBack
            | BrowserAction::GoForward => &[],
        }
    }

    pub fn declaration(self) -> FunctionDeclaration {
        let mut properties = Map::new();
        for key in self.param_keys() {
            properties.insert((*key).to_string(), param_schema(key));
        }
        let required: Vec<&str> = self
            .required_groups()
            .iter()
            .filter(|group| group.len() == 1)
            .map(|group| group[0])
            .collect();

        let mut parameters = json!({
            "type": "object",
            "properties": properties,
        });
        if !required.is_empty() {
            parameters["required"] = json!(required);
        }

        FunctionDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters,
        }
    }
}

fn param_schema(key: &str) -> Value {
    match key {
        "x" | "y" | "destination_x" | "destination_y" => {
            json!({"type": "number", "description": "Viewport coordinate in CSS pixels."})
        }
        "coordinate" => json!({
            "type": "object",
            "properties": {"x": {"type": "number"}, "y": {"type": "number"}},
            "required": ["x", "y"],
        }),
        "selector" | "target" => json!({"type": "string", "description": "CSS selector of the element."}),
        "text" | "value" => json!({"type": "string", "description": "Text to enter."}),
        "press_enter" | "clear_before_typing" => json!({"type": "boolean"}),
        "direction" => json!({"type": "string", "enum": ["up", "down", "left", "right"]}),
        "amount" | "magnitude" => json!({"type": "number", "description": "Distance in pixels."}),
        "address" | "uri" | "url" => json!({"type": "string", "description": "Absolute URL to open."}),
        "seconds" | "milliseconds" => json!({"type": "number"}),
        "key" => json!({"type": "string", "description": "Key name such as Enter or ArrowDown."}),
        "keys" => json!({"type": "array", "items": {"type": "string"}}),
        _ => json!({"type": "string"}),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

/// Union of every browser action's parameters. Only the subset relevant to
/// the called action is ever populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrowserActionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinate: Option<Coordinate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub press_enter: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_before_typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milliseconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

impl BrowserActionParams {
    /// Pick the keys `action` accepts out of raw model arguments and type
    /// them. Unrelated keys are dropped; missing required keys and badly
    /// typed values are errors.
    pub fn for_action(action: BrowserAction, args: &Map<String, Value>) -> Result<Self, String> {
        let subset: Map<String, Value> = action
            .param_keys()
            .iter()
            .filter_map(|key| {
                args.get(*key)
                    .filter(|value| !value.is_null())
                    .map(|value| ((*key).to_string(), value.clone()))
            })
            .collect();

        for group in action.required_groups() {
            let satisfied = group
                .iter()
                .any(|option| option.split('+').all(|key| subset.contains_key(key)));
            if !satisfied {
                return Err(format!(
                    "{} requires {}",
                    action.name(),
                    group.join(" or ").replace('+', " and ")
                ));
            }
        }

        serde_json::from_value(Value::Object(subset))
            .map_err(|err| format!("Invalid arguments for {}: {err}", action.name()))
    }
}

/// The host's content-script bridge.
#[async_trait]
pub trait BrowserActionExecutor: Send + Sync {
    /// Run one action. The raw reply is validated by the caller.
    async fn execute(
        &self,
        action: BrowserAction,
        params: &BrowserActionParams,
    ) -> Result<Value, String>;

    /// Capture the current page; the raw reply is validated by the caller.
    async fn capture_page_context(&self) -> Result<Value, String>;
}

/// Executor for hosts with no browser surface attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedBrowser;

#[async_trait]
impl BrowserActionExecutor for DetachedBrowser {
    async fn execute(
        &self,
        action: BrowserAction,
        _params: &BrowserActionParams,
    ) -> Result<Value, String> {
        Err(format!("No browser is attached; cannot {}.", action.name()))
    }

    async fn capture_page_context(&self) -> Result<Value, String> {
        Err("No browser is attached.".to_string())
    }
}
