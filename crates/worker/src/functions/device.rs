//! 内置设备任务：`cli`、`cfg`、`test`

use std::collections::HashMap;

use async_trait::async_trait;
use fleetd_core::traits::operations;
use fleetd_core::{EngineError, EngineResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{DeviceTask, TaskContext, TaskOutput};

fn commands_param(ctx: &TaskContext<'_>) -> EngineResult<Vec<String>> {
    let mut commands = ctx.request.param_str_list("commands");
    if commands.is_empty() {
        commands = ctx.request.param_str_list("command");
    }
    if commands.is_empty() {
        return Err(EngineError::InvalidParameters(
            "缺少commands参数".to_string(),
        ));
    }
    commands.iter().map(|c| ctx.render(c)).collect()
}

/// 逐条发送命令，返回 命令 -> 输出
///
/// `use_cache` 为真时，缓存中已有输出的命令不再发送。
pub struct CliTask;

#[async_trait]
impl DeviceTask for CliTask {
    async fn run(&self, ctx: &TaskContext<'_>) -> EngineResult<TaskOutput> {
        let commands = commands_param(ctx)?;
        if ctx.request.dry_run {
            return Ok(TaskOutput::ok(json!(commands)));
        }

        let use_cache = ctx.request.param_bool("use_cache");
        let mut outputs = Map::new();
        for command in commands {
            if use_cache {
                if let Some(cached) = ctx.cache.get(&command) {
                    outputs.insert(command, cached.clone());
                    continue;
                }
            }
            let output = ctx
                .step(&command, operations::CLI, json!({ "command": command }))
                .await?;
            outputs.insert(command, output);
        }
        Ok(TaskOutput::ok(Value::Object(outputs)))
    }
}

/// 渲染配置并下发；`dry_run` 时只返回渲染结果
pub struct CfgTask;

impl CfgTask {
    fn template(ctx: &TaskContext<'_>) -> EngineResult<String> {
        match ctx.request.params.get("config") {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(Value::Array(lines)) => Ok(lines
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n")),
            _ => Err(EngineError::InvalidParameters(
                "缺少config参数".to_string(),
            )),
        }
    }
}

#[async_trait]
impl DeviceTask for CfgTask {
    async fn run(&self, ctx: &TaskContext<'_>) -> EngineResult<TaskOutput> {
        let rendered = ctx.render(&Self::template(ctx)?)?;
        if ctx.request.dry_run {
            return Ok(TaskOutput::ok(Value::String(rendered)));
        }

        let output = ctx
            .step("commit", operations::CONFIG, json!({ "config": rendered }))
            .await?;
        Ok(TaskOutput::ok(json!({
            "rendered": rendered,
            "output": output,
        })))
    }
}

/// 检查方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckKind {
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "!contains")]
    NotContains,
    #[serde(rename = "equal")]
    Equal,
    #[serde(rename = "regex")]
    Regex,
}

/// 单项检查
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: String,
    pub test: CheckKind,
    pub pattern: Value,
}

impl CheckSpec {
    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!("{} {:?} {}", self.command, self.test, text_of(&self.pattern))
        })
    }

    fn evaluate(&self, output: &Value) -> EngineResult<bool> {
        let text = text_of(output);
        let pattern = text_of(&self.pattern);
        Ok(match self.test {
            CheckKind::Contains => text.contains(&pattern),
            CheckKind::NotContains => !text.contains(&pattern),
            CheckKind::Equal => match (output, &self.pattern) {
                (Value::String(_), _) | (_, Value::String(_)) => text.trim() == pattern.trim(),
                _ => output == &self.pattern,
            },
            CheckKind::Regex => Regex::new(&pattern)
                .map_err(|e| EngineError::InvalidParameters(format!("无效的正则表达式: {e}")))?
                .is_match(&text),
        })
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 执行命令并校验输出，任一检查未通过则设备失败
pub struct TestTask;

impl TestTask {
    fn checks(ctx: &TaskContext<'_>) -> EngineResult<Vec<CheckSpec>> {
        let raw = ctx
            .request
            .params
            .get("tests")
            .cloned()
            .ok_or_else(|| EngineError::InvalidParameters("缺少tests参数".to_string()))?;
        let mut checks: Vec<CheckSpec> = serde_json::from_value(raw)
            .map_err(|e| EngineError::InvalidParameters(format!("无效的tests参数: {e}")))?;
        for check in &mut checks {
            check.command = ctx.render(&check.command)?;
        }
        Ok(checks)
    }
}

#[async_trait]
impl DeviceTask for TestTask {
    async fn run(&self, ctx: &TaskContext<'_>) -> EngineResult<TaskOutput> {
        let checks = Self::checks(ctx)?;
        if ctx.request.dry_run {
            return Ok(TaskOutput::ok(serde_json::to_value(&checks)?));
        }

        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut report = Vec::with_capacity(checks.len());
        let mut failures = 0usize;

        for check in &checks {
            let output = match outputs.get(&check.command) {
                Some(output) => output.clone(),
                None => {
                    let output = ctx
                        .step(
                            &check.command,
                            operations::CLI,
                            json!({ "command": check.command }),
                        )
                        .await?;
                    outputs.insert(check.command.clone(), output.clone());
                    output
                }
            };

            let passed = check.evaluate(&output)?;
            if !passed {
                failures += 1;
            }
            report.push(json!({
                "name": check.label(),
                "command": check.command,
                "test": check.test,
                "passed": passed,
            }));
        }

        let result = Value::Array(report);
        if failures > 0 {
            Ok(TaskOutput::failed(
                result,
                format!("{}/{} 项检查未通过", failures, checks.len()),
            ))
        } else {
            Ok(TaskOutput::ok(result))
        }
    }
}
