use serde_json::{Map, Value};

use crate::models::Device;
use crate::{EngineError, EngineResult};

/// 模板渲染接口，输出对引擎是不透明的字符串
pub trait Renderer: Send + Sync {
    fn render(&self, template: &str, device: &Device, params: &Map<String, Value>)
        -> EngineResult<String>;
}

/// 简单占位符替换
///
/// 支持 `{{ host.name }}`、`{{ host.hostname }}`、`{{ host.platform }}`、
/// `{{ host.data.<key> }}` 和 `{{ params.<key> }}`。未闭合的 `{{` 原样保留。
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstitutionRenderer;

impl SubstitutionRenderer {
    pub fn new() -> Self {
        Self
    }

    fn lookup(&self, path: &str, device: &Device, params: &Map<String, Value>) -> Option<String> {
        let mut parts = path.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("host"), Some("name"), None) => Some(device.name.clone()),
            (Some("host"), Some("hostname"), None) => {
                Some(device.hostname.clone().unwrap_or_else(|| device.name.clone()))
            }
            (Some("host"), Some("platform"), None) => device.platform.clone(),
            (Some("host"), Some("data"), Some(key)) => device.data.get(key).map(value_to_text),
            (Some("params"), Some(key), None) => params.get(key).map(value_to_text),
            _ => None,
        }
    }
}

impl Renderer for SubstitutionRenderer {
    fn render(
        &self,
        template: &str,
        device: &Device,
        params: &Map<String, Value>,
    ) -> EngineResult<String> {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            let body = &rest[open + 2..];
            let Some(close) = body.find("}}") else {
                break;
            };
            let path = body[..close].trim();
            let value = self.lookup(path, device, params).ok_or_else(|| {
                EngineError::InvalidParameters(format!(
                    "设备 {} 的模板变量无法解析: {path}",
                    device.name
                ))
            })?;

            rendered.push_str(&rest[..open]);
            rendered.push_str(&value);
            rest = &body[close + 2..];
        }

        rendered.push_str(rest);
        Ok(rendered)
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
