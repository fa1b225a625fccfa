use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{json, Map, Value};

use crate::config::Config;

static SCRIPT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script").expect("Failed to parse script selector"));
static EXECUTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"name="execution" value="([^"]+)""#).expect("Failed to compile execution regex")
});
static DEF_ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"var def\s*=\s*\{").expect("Failed to compile def anchor regex"));
static OLD_INFO_ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"oldInfo:\s*\{").expect("Failed to compile oldInfo anchor regex"));
static REALNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"realname:\s*"([^"]+)""#).expect("Failed to compile realname regex"));
static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"number:\s*'([^']+)'").expect("Failed to compile number regex"));

#[derive(Debug)]
pub enum ParseError {
    /// The login page no longer carries the hidden execution input.
    ExecutionTokenNotFound,
    /// A structural anchor (`var def = {`, `oldInfo: {`) is gone from the
    /// landing page, which means the page layout changed upstream.
    AnchorNotFound(&'static str),
    /// The anchored fragment never closes its braces.
    UnbalancedFragment(&'static str),
    /// The fragment does not look like `key: value, ...` pairs even after
    /// quoting bare keys.
    Sanitize { anchor: &'static str, detail: String },
    /// A page-level field (realname, number) is missing.
    FieldNotFound(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::ExecutionTokenNotFound => {
                write!(f, "hidden 'execution' input not found in login page")
            }
            ParseError::AnchorNotFound(anchor) => {
                write!(f, "structural anchor '{}' not found in landing page", anchor)
            }
            ParseError::UnbalancedFragment(anchor) => {
                write!(f, "object literal at '{}' has unbalanced braces", anchor)
            }
            ParseError::Sanitize { anchor, detail } => {
                write!(f, "fragment at '{}' is not key/value shaped: {}", anchor, detail)
            }
            ParseError::FieldNotFound(field) => {
                write!(f, "page field '{}' not found in landing page", field)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Pulls the single-use `execution` token out of the CAS login page.
pub fn extract_execution(html: &str) -> Result<String, ParseError> {
    EXECUTION_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(ParseError::ExecutionTokenNotFound)
}

/// Collapses whitespace runs outside string literals to single spaces. The
/// script text arrives pretty-printed or minified depending on the server
/// build; whitespace inside quoted values passes through unchanged.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    let mut pending_space = false;
    for c in text.chars() {
        if let Some(quote) = in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if c == '"' || c == '\'' {
            in_string = Some(c);
        }
        out.push(c);
    }
    out
}

/// Quotes every bare object key found outside string literals, e.g. `uid:`
/// or `jrdqtlqk[]:` right after `{` or `,`. Key-shaped text inside quoted
/// values does not count; the scan tracks quote and escape state the same
/// way the brace scan does.
fn quote_bare_keys(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len() + 16);
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    // Last significant character outside strings; keys only follow `{` or `,`.
    let mut prev = '\0';
    let mut chars = fragment.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if let Some(quote) = in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
                prev = c;
            }
            continue;
        }
        if c == '"' || c == '\'' {
            in_string = Some(c);
            out.push(c);
            continue;
        }
        if c.is_whitespace() {
            out.push(c);
            continue;
        }
        if (c.is_ascii_alphabetic() || c == '_') && matches!(prev, '{' | ',') {
            let start = i;
            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    chars.next();
                    end = j + next.len_utf8();
                } else {
                    break;
                }
            }
            if fragment[end..].starts_with("[]") {
                chars.next();
                chars.next();
                end += 2;
            }
            let identifier = &fragment[start..end];
            if fragment[end..].trim_start().starts_with(':') {
                out.push('"');
                out.push_str(identifier);
                out.push('"');
            } else {
                out.push_str(identifier);
            }
            prev = c;
            continue;
        }
        out.push(c);
        prev = c;
    }
    out
}

/// Quotes every bare object key in a script-literal fragment and parses the
/// result as a JSON object. Values pass through unchanged.
pub fn parse_object_literal(
    fragment: &str,
    anchor: &'static str,
) -> Result<Map<String, Value>, ParseError> {
    let trimmed = fragment.trim();
    if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        return Err(ParseError::Sanitize {
            anchor,
            detail: "fragment is not brace-delimited".to_string(),
        });
    }
    let quoted = quote_bare_keys(trimmed);
    match serde_json::from_str::<Value>(&quoted) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ParseError::Sanitize {
            anchor,
            detail: "fragment is not an object".to_string(),
        }),
        Err(e) => Err(ParseError::Sanitize {
            anchor,
            detail: e.to_string(),
        }),
    }
}

/// Scans a balanced `{...}` starting at `start` (which must point at the
/// opening brace). Braces inside string literals do not count.
fn balanced_braces(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == quote {
                in_string = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => in_string = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_fragment<'a>(
    page: &'a str,
    anchor_re: &Regex,
    anchor: &'static str,
) -> Result<&'a str, ParseError> {
    let m = anchor_re.find(page).ok_or(ParseError::AnchorNotFound(anchor))?;
    // The anchor regex ends on the opening brace.
    balanced_braces(page, m.end() - 1).ok_or(ParseError::UnbalancedFragment(anchor))
}

/// Extracts and merges the user's last-known form state from the landing
/// page: session-scoped defaults first (`var def = {...}`), then the prior
/// answers (`oldInfo: {...}`) on top, then the page-level realname/number.
pub fn parse_form_state(html: &str) -> Result<Map<String, Value>, ParseError> {
    // Both fragments live inside script blocks; searching script text rather
    // than the raw page keeps markup out of the brace scan.
    let document = Html::parse_document(html);
    let mut scripts = String::new();
    for script in document.select(&SCRIPT_SELECTOR) {
        for text in script.text() {
            scripts.push_str(text);
            scripts.push(' ');
        }
    }
    let scripts = normalize_whitespace(&scripts);

    let def_fragment = extract_fragment(&scripts, &DEF_ANCHOR_RE, "var def = {")?;
    let old_fragment = extract_fragment(&scripts, &OLD_INFO_ANCHOR_RE, "oldInfo: {")?;

    let mut state = parse_object_literal(def_fragment, "var def = {")?;
    let old_info = parse_object_literal(old_fragment, "oldInfo: {")?;
    // Prior answers win over session defaults on collision.
    for (k, v) in old_info {
        state.insert(k, v);
    }

    let realname = REALNAME_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(ParseError::FieldNotFound("realname"))?;
    let number = NUMBER_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(ParseError::FieldNotFound("number"))?;
    state.insert("name".to_string(), json!(realname));
    state.insert("number".to_string(), json!(number));

    Ok(state)
}

/// Overlays today's values on the harvested state: date, creation timestamp,
/// the configured location strings, and the fixed flag fields; then strips
/// every field the remote schema no longer accepts.
pub fn derive_payload(
    mut state: Map<String, Value>,
    now: DateTime<Local>,
    config: &Config,
) -> Map<String, Value> {
    state.insert("date".to_string(), json!(now.format("%Y%m%d").to_string()));
    state.insert("created".to_string(), json!(now.timestamp()));
    state.insert("address".to_string(), json!(config.address));
    state.insert("area".to_string(), json!(config.area));

    let mut parts = config.area.split_whitespace();
    let province = parts.next().unwrap_or_default();
    let city = parts.next().unwrap_or_default();
    state.insert("province".to_string(), json!(province));
    state.insert("city".to_string(), json!(city));

    for (k, v) in &config.fixed_fields {
        state.insert(k.clone(), v.clone());
    }
    for field in &config.excluded_fields {
        state.remove(field);
    }
    state
}

/// Full harvest step: parse the landing page and derive today's payload.
pub fn build_payload(
    html: &str,
    now: DateTime<Local>,
    config: &Config,
) -> Result<Map<String, Value>, ParseError> {
    let state = parse_form_state(html)?;
    Ok(derive_payload(state, now, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LOGIN_PAGE: &str = r#"<html><body>
        <form id="fm1" action="/cas/login" method="post">
            <input type="hidden" name="lt" value="" />
            <input type="hidden" name="execution" value="e1s1-abc123" />
            <input type="hidden" name="_eventId" value="submit" />
        </form>
    </body></html>"#;

    const LANDING_PAGE: &str = r#"<html><head><title>每日上报</title></head><body>
    <script type="text/javascript">
        var vm = new Vue({
            data: {
                oldInfo: {sfzx: 1, tw: 1, address: "旧地址",
                          area: "旧省 旧市 旧区", sfcyglq: 0,
                          jcjgqr: 0, remark: "无"},
                realname: "张三",
                number: '3180100000',
                loaded: true
            }
        });
    </script>
    <script type="text/javascript">
        var def = {id: 99887766, uid: "8839021",
                   date: "20210301", created: 1614556800,
                   sfzx: 0, tw: 3, ismoved: 0};
    </script>
    </body></html>"#;

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2021, 3, 2, 8, 30, 0).unwrap()
    }

    #[test]
    fn execution_token_extracted() {
        assert_eq!(extract_execution(LOGIN_PAGE).unwrap(), "e1s1-abc123");
    }

    #[test]
    fn missing_execution_token_is_a_parse_error() {
        let err = extract_execution("<html><body>no form here</body></html>").unwrap_err();
        assert!(matches!(err, ParseError::ExecutionTokenNotFound));
    }

    #[test]
    fn bare_keys_parse_like_quoted_keys() {
        let bare = parse_object_literal(r#"{a: 1, b: "x", c_d: "", e[]: 0}"#, "test").unwrap();
        let quoted: Map<String, Value> =
            serde_json::from_str(r#"{"a": 1, "b": "x", "c_d": "", "e[]": 0}"#).unwrap();
        assert_eq!(Value::Object(bare), Value::Object(quoted));
    }

    #[test]
    fn already_quoted_keys_survive_sanitizing() {
        let map = parse_object_literal(r#"{"a": 1, b: 2}"#, "test").unwrap();
        assert_eq!(map["a"], json!(1));
        assert_eq!(map["b"], json!(2));
    }

    #[test]
    fn non_object_fragment_fails_sanitize() {
        assert!(matches!(
            parse_object_literal("function() { return 1; }", "test").unwrap_err(),
            ParseError::Sanitize { .. }
        ));
        assert!(matches!(
            parse_object_literal("{a:}", "test").unwrap_err(),
            ParseError::Sanitize { .. }
        ));
    }

    #[test]
    fn braces_inside_string_values_do_not_confuse_the_scan() {
        let text = r#"var def = {remark: "has } inside", ok: 1}; trailing"#;
        let fragment = extract_fragment(text, &DEF_ANCHOR_RE, "var def = {").unwrap();
        let map = parse_object_literal(fragment, "var def = {").unwrap();
        assert_eq!(map["ok"], json!(1));
        assert_eq!(map["remark"], json!("has } inside"));
    }

    #[test]
    fn key_shaped_text_inside_string_values_passes_through() {
        let map = parse_object_literal(r#"{remark: "home, address: unchanged", ok: 1}"#, "test")
            .unwrap();
        assert_eq!(map["remark"], json!("home, address: unchanged"));
        assert_eq!(map["ok"], json!(1));
    }

    #[test]
    fn escaped_quotes_inside_values_do_not_end_the_string() {
        let map = parse_object_literal(r#"{a: "say \"hi, x: 1\"", b: 2}"#, "test").unwrap();
        assert_eq!(map["a"], json!("say \"hi, x: 1\""));
        assert_eq!(map["b"], json!(2));
    }

    #[test]
    fn whitespace_inside_string_values_is_preserved() {
        let scripts = normalize_whitespace("var def   =\n   {remark: \"two  spaces,   three\", ok: 1};");
        assert!(scripts.starts_with("var def = {"));
        let fragment = extract_fragment(&scripts, &DEF_ANCHOR_RE, "var def = {").unwrap();
        let map = parse_object_literal(fragment, "var def = {").unwrap();
        assert_eq!(map["remark"], json!("two  spaces,   three"));
    }

    #[test]
    fn landing_page_state_merges_old_info_over_defaults() {
        let state = parse_form_state(LANDING_PAGE).unwrap();
        // From def only.
        assert_eq!(state["id"], json!(99887766));
        assert_eq!(state["uid"], json!("8839021"));
        // oldInfo overrides def on collision.
        assert_eq!(state["sfzx"], json!(1));
        assert_eq!(state["tw"], json!(1));
        // Page-level fields.
        assert_eq!(state["name"], json!("张三"));
        assert_eq!(state["number"], json!("3180100000"));
    }

    #[test]
    fn missing_anchor_fails_loudly() {
        let page = "<html><script>var unrelated = 1;</script></html>";
        assert!(matches!(
            parse_form_state(page).unwrap_err(),
            ParseError::AnchorNotFound(_)
        ));
    }

    #[test]
    fn derived_payload_overwrites_stale_fields() {
        let config = Config::default();
        let payload = build_payload(LANDING_PAGE, fixed_now(), &config).unwrap();

        assert_eq!(payload["date"], json!("20210302"));
        assert_eq!(payload["created"], json!(fixed_now().timestamp()));
        assert_eq!(payload["address"], json!(config.address));
        assert_eq!(payload["area"], json!(config.area));
        assert_eq!(payload["province"], json!("浙江省"));
        assert_eq!(payload["city"], json!("杭州市"));
        // Fixed flags overwrite whatever was harvested.
        assert_eq!(payload["sfqrxxss"], json!(1));
        assert_eq!(payload["sqhzjkkys"], json!(1));
        // Deprecated fields are stripped even though the page still carries them.
        assert!(!payload.contains_key("jcjgqr"));
        assert!(!payload.contains_key("ismoved"));
        // Prior answers without an override survive untouched.
        assert_eq!(payload["remark"], json!("无"));
    }

    #[test]
    fn derivation_is_independent_of_harvested_values() {
        let config = Config::default();
        let mut state = Map::new();
        state.insert("date".to_string(), json!("19990101"));
        state.insert("address".to_string(), json!("elsewhere"));
        let payload = derive_payload(state, fixed_now(), &config);
        assert_eq!(payload["date"], json!("20210302"));
        assert_eq!(payload["address"], json!(config.address));
    }
}
