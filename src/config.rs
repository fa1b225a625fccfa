use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Map, Value};

/// The exact strings the save endpoint uses to describe known failure cases.
/// The server communicates outcomes only as free text, so classification
/// lives or dies on these literals; keeping them in one table means a
/// server-side wording change is a one-line fix.
#[derive(Debug, Clone)]
pub struct ServerMessages {
    pub already_submitted: String,
    pub wrong_captcha: String,
}

impl Default for ServerMessages {
    fn default() -> Self {
        ServerMessages {
            // "already submitted today"
            already_submitted: "今天已经填报了".to_string(),
            // "verification code incorrect"
            wrong_captcha: "验证码错误".to_string(),
        }
    }
}

/// All deployment-specific knobs of the pipeline. Constructed in `main` from
/// defaults plus CLI flags; tests substitute mock-server URLs and short
/// backoffs.
#[derive(Debug, Clone)]
pub struct Config {
    /// CAS login page; GET for the execution token, POST for credentials.
    pub login_url: String,
    /// CAS RSA public key endpoint.
    pub pubkey_url: String,
    /// Report landing page carrying the embedded form state.
    pub base_url: String,
    /// Report submission endpoint.
    pub save_url: String,
    /// Challenge image endpoint, only used when `captcha_required`.
    pub captcha_url: String,

    /// Marker present in the CAS response body only when login was bounced
    /// back to the sign-in page ("unified identity authentication" banner).
    pub login_branding_marker: String,

    /// Fixed location strings for the derived payload. Province and city are
    /// split off `area` at submission time.
    pub address: String,
    pub area: String,

    /// Flag and status fields overwritten on every submission. Opaque
    /// deployment data: field codes and values come straight from the
    /// deployed form, not from anything derivable.
    pub fixed_fields: Map<String, Value>,
    /// Fields the remote schema no longer accepts and must be stripped from
    /// the harvested state before submission.
    pub excluded_fields: Vec<String>,

    /// Whether this deployment gates submission behind a captcha.
    pub captcha_required: bool,
    /// Form field carrying the recognized captcha text.
    pub captcha_field: String,

    pub max_trials: u32,
    pub retry_backoff: Duration,
    pub messages: ServerMessages,

    /// When set, the derived payload is dumped as JSON before each
    /// submission, for inspection.
    pub dump_payload: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let mut fixed = Map::new();
        fixed.insert("jrdqtlqk[]".to_string(), json!(0));
        fixed.insert("jrdqjcqk[]".to_string(), json!(0));
        // applied for the municipal health code
        fixed.insert("sfsqhzjkk".to_string(), json!(1));
        // health code color, 1 = green
        fixed.insert("sqhzjkkys".to_string(), json!(1));
        // confirms the information is truthful
        fixed.insert("sfqrxxss".to_string(), json!(1));
        fixed.insert("jcqzrq".to_string(), json!(""));
        fixed.insert("gwszdd".to_string(), json!(""));
        fixed.insert("szgjcs".to_string(), json!(""));

        Config {
            login_url: "https://zjuam.zju.edu.cn/cas/login?service=https%3A%2F%2Fhealthreport.zju.edu.cn%2Fa_zju%2Fapi%2Fsso%2Findex%3Fredirect%3Dhttps%253A%252F%252Fhealthreport.zju.edu.cn%252Fncov%252Fwap%252Fdefault%252Findex".to_string(),
            pubkey_url: "https://zjuam.zju.edu.cn/cas/v2/getPubKey".to_string(),
            base_url: "https://healthreport.zju.edu.cn/ncov/wap/default/index".to_string(),
            save_url: "https://healthreport.zju.edu.cn/ncov/wap/default/save".to_string(),
            captcha_url: "https://healthreport.zju.edu.cn/ncov/wap/default/code".to_string(),
            login_branding_marker: "统一身份认证".to_string(),
            address: "浙江省杭州市西湖区".to_string(),
            area: "浙江省 杭州市 西湖区".to_string(),
            fixed_fields: fixed,
            excluded_fields: vec!["jcjgqr".to_string(), "ismoved".to_string()],
            captcha_required: false,
            captcha_field: "verifyCode".to_string(),
            max_trials: 5,
            retry_backoff: Duration::from_secs(5),
            messages: ServerMessages::default(),
            dump_payload: None,
        }
    }
}
