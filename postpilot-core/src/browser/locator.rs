use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::BrowserError;

/// How a UI target is found inside the current document root.
///
/// Written in config as `css:<selector>`, `xpath:<expression>` or `active`
/// (the focused element). A bare string is read as CSS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Locator {
    Css(String),
    XPath(String),
    Active,
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn xpath(expression: impl Into<String>) -> Self {
        Locator::XPath(expression.into())
    }

    /// Substitutes `{name}` placeholders, e.g. `div[category-id='{category}']`.
    pub fn render(&self, vars: &[(&str, &str)]) -> Locator {
        let fill = |template: &str| {
            vars.iter().fold(template.to_string(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        };
        match self {
            Locator::Css(selector) => Locator::Css(fill(selector)),
            Locator::XPath(expression) => Locator::XPath(fill(expression)),
            Locator::Active => Locator::Active,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(selector) => write!(f, "css:{selector}"),
            Locator::XPath(expression) => write!(f, "xpath:{expression}"),
            Locator::Active => f.write_str("active"),
        }
    }
}

impl FromStr for Locator {
    type Err = BrowserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(BrowserError::Configuration("empty locator".into()));
        }
        if trimmed == "active" {
            return Ok(Locator::Active);
        }
        if let Some(rest) = trimmed.strip_prefix("css:") {
            return non_empty(rest).map(Locator::Css);
        }
        if let Some(rest) = trimmed.strip_prefix("xpath:") {
            return non_empty(rest).map(Locator::XPath);
        }
        Ok(Locator::Css(trimmed.to_string()))
    }
}

fn non_empty(value: &str) -> Result<String, BrowserError> {
    let value = value.trim();
    if value.is_empty() {
        Err(BrowserError::Configuration("locator has no body".into()))
    } else {
        Ok(value.to_string())
    }
}

impl TryFrom<String> for Locator {
    type Error = BrowserError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Locator> for String {
    fn from(value: Locator) -> Self {
        value.to_string()
    }
}

/// What to do with a located element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    /// Native click dispatched through the page.
    Click,
    /// `element.click()` evaluated in the page; works on elements that are
    /// covered or not yet interactive for pointer events.
    #[default]
    ScriptClick,
    /// Assigns `value` by script and fires `input`/`change`.
    SetValue,
    /// Focuses the element and inserts text as keyboard input.
    Type,
}

impl Interaction {
    pub fn action<'a>(&self, text: &'a str) -> Action<'a> {
        match self {
            Interaction::Click => Action::Click,
            Interaction::ScriptClick => Action::ScriptClick,
            Interaction::SetValue => Action::SetValue(text),
            Interaction::Type => Action::Type(text),
        }
    }
}

/// A concrete interaction with its payload, handed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    Click,
    ScriptClick,
    SetValue(&'a str),
    Type(&'a str),
}

impl Action<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click => "click",
            Action::ScriptClick => "script_click",
            Action::SetValue(_) => "set_value",
            Action::Type(_) => "type",
        }
    }
}

/// One `(locate, interact)` pair of an ordered strategy list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub locate: Locator,
    #[serde(default)]
    pub interact: Interaction,
}

impl Strategy {
    pub fn new(locate: Locator, interact: Interaction) -> Self {
        Self { locate, interact }
    }
}

/// Ordered fallbacks for one UI target; the first strategy whose element is
/// visible wins. Platform markup drift is absorbed by editing this list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyList(pub Vec<Strategy>);

impl StrategyList {
    pub fn new(strategies: Vec<Strategy>) -> Self {
        Self(strategies)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Strategy> {
        self.0.iter()
    }

    pub fn locators(&self) -> Vec<Locator> {
        self.0.iter().map(|s| s.locate.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    Escape,
    Tab,
    Enter,
}

impl Key {
    pub fn name(&self) -> &'static str {
        match self {
            Key::Escape => "Escape",
            Key::Tab => "Tab",
            Key::Enter => "Enter",
        }
    }

    pub fn virtual_key_code(&self) -> i64 {
        match self {
            Key::Escape => 27,
            Key::Tab => 9,
            Key::Enter => 13,
        }
    }

    /// Text the key produces, for keys that insert characters.
    pub fn text(&self) -> Option<&'static str> {
        match self {
            Key::Enter => Some("\r"),
            Key::Escape | Key::Tab => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_locators() {
        assert_eq!(
            "css:button.btn_logout".parse::<Locator>().unwrap(),
            Locator::css("button.btn_logout")
        );
        assert_eq!(
            "xpath://button[contains(., '발행')]".parse::<Locator>().unwrap(),
            Locator::xpath("//button[contains(., '발행')]")
        );
        assert_eq!("active".parse::<Locator>().unwrap(), Locator::Active);
        assert_eq!("#post-title-inp".parse::<Locator>().unwrap(), Locator::css("#post-title-inp"));
        assert!("css:".parse::<Locator>().is_err());
        assert!("  ".parse::<Locator>().is_err());
    }

    #[test]
    fn render_fills_placeholders() {
        let template = Locator::css("div[category-id='{category}']");
        assert_eq!(
            template.render(&[("category", "42")]),
            Locator::css("div[category-id='42']")
        );
    }

    #[test]
    fn strategy_list_deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            title: StrategyList,
        }
        let holder: Holder = toml::from_str(
            r#"title = [
                { locate = "css:.se-documentTitle", interact = "type" },
                { locate = "xpath://textarea" },
            ]"#,
        )
        .unwrap();
        assert_eq!(holder.title.0.len(), 2);
        assert_eq!(holder.title.0[0].interact, Interaction::Type);
        assert_eq!(holder.title.0[1].interact, Interaction::ScriptClick);
    }
}
