//! 按行差异

use std::time::Duration;

use similar::{Algorithm, ChangeTag, TextDiff};

/// 差异计算的时间上限，超时后输出较粗的差异
const DIFF_DEADLINE: Duration = Duration::from_secs(2);

/// 生成两个文本之间的按行差异
///
/// 输出只包含变化行：删除行以 `-` 开头，新增行以 `+` 开头。两个文本相同时
/// 返回空字符串。
pub fn line_diff(old_label: &str, new_label: &str, old: &str, new: &str) -> String {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .timeout(DIFF_DEADLINE)
        .diff_slices(&a, &b);

    let mut body = String::new();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Delete => push_line(&mut body, '-', change.value()),
            ChangeTag::Insert => push_line(&mut body, '+', change.value()),
            ChangeTag::Equal => {}
        }
    }

    if body.is_empty() {
        return body;
    }
    format!("--- {old_label}\n+++ {new_label}\n{body}")
}

fn push_line(out: &mut String, marker: char, line: &str) {
    out.push(marker);
    out.push_str(line);
    out.push('\n');
}
