//! Foundational public types: the persisted artifact definition (§3) and the
//! API dispatcher's response envelope (§4.7).

use serde::{Deserialize, Serialize};

/// One row of `mce_calc_object_info` (§3) — an artifact's persisted
/// definition. Presentation fields (`object_name`, `custom_tag`, `parent_id`,
/// `remark`, `sort_number`) are opaque to the engine; it only round-trips
/// them through the store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ArtifactDef {
    pub object_id: String,
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub custom_tag: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub python_code: String,
    #[serde(default)]
    pub python_expr: String,
    #[serde(default)]
    pub lru_maxsize: u32,
    #[serde(default)]
    pub ttl_seconds: u32,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub sort_number: i64,
    /// Set by the store on every `add`/`update`; ignored on input.
    #[serde(default)]
    pub last_updated_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl ArtifactDef {
    /// An artifact has a private cache iff both knobs are positive (§3).
    pub fn has_cache(&self) -> bool {
        self.lru_maxsize > 0 && self.ttl_seconds > 0
    }
}

/// The uniform response envelope every `POST /run/<op_name>` call returns
/// (§4.7, §6). `code = 0` on success, `-1` for a dispatcher-level failure,
/// `-2` for a framework-level failure (bad body, unknown route).
#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    pub code: i32,
    pub msg: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    pub fn ok(data: serde_json::Value) -> Self {
        Envelope {
            code: 0,
            msg: None,
            data: Some(data),
        }
    }

    pub fn dispatch_error(msg: impl Into<String>) -> Self {
        Envelope {
            code: -1,
            msg: Some(msg.into()),
            data: None,
        }
    }

    pub fn framework_error(msg: impl Into<String>) -> Self {
        Envelope {
            code: -2,
            msg: Some(msg.into()),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_requires_both_knobs_positive() {
        let mut def = ArtifactDef {
            object_id: "a".into(),
            lru_maxsize: 4,
            ttl_seconds: 0,
            ..Default::default()
        };
        assert!(!def.has_cache());
        def.ttl_seconds = 60;
        assert!(def.has_cache());
    }

    #[test]
    fn envelope_ok_serializes_code_zero() {
        let env = Envelope::ok(serde_json::json!(42));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["code"], 0);
        assert_eq!(v["data"], 42);
    }
}
