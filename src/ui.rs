//! Console styling helpers shared by the execution runtime and inspector.

use crossterm::cursor;
use crossterm::style::Stylize;
use std::io::stdout;
use std::time::Duration;

pub const SPINNER_FRAMES: &[char] = &['-', '\\', '|', '/'];
pub const SPINNER_REFRESH: Duration = Duration::from_millis(100);

pub fn scenario_title(text: &str) -> String {
    format!("{}", text.bold().green())
}

pub fn step_title(text: &str) -> String {
    format!("{}", text.bold())
}

pub fn error(text: &str) -> String {
    format!("{}", text.red().bold())
}

pub fn error_message(text: &str) -> String {
    format!("{}", text.red())
}

pub fn warning(text: &str) -> String {
    format!("{}", text.yellow())
}

/// Dim styling for narrative text and echoed command output.
pub fn verbose(text: &str) -> String {
    format!("{}", text.grey())
}

pub fn spinner(text: &str) -> String {
    format!("{}", text.green())
}

pub fn hide_cursor() {
    let _ = crossterm::execute!(stdout(), cursor::Hide);
}

pub fn show_cursor() {
    let _ = crossterm::execute!(stdout(), cursor::Show);
}

/// Indent the continuation lines of a multi-line command so it lines up with
/// the prefix the caller printed before the first line.
pub fn indent_multiline_command(command: &str, spaces: usize) -> String {
    let indent = " ".repeat(spaces);
    let mut lines = command.split('\n');
    let mut out = String::new();
    if let Some(first) = lines.next() {
        out.push_str(first);
    }
    for line in lines {
        out.push('\n');
        if !line.is_empty() {
            out.push_str(&indent);
        }
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indent_leaves_single_lines_untouched() {
        assert_eq!(indent_multiline_command("echo hi", 4), "echo hi");
    }

    #[test]
    fn indent_applies_to_continuation_lines_only() {
        let indented = indent_multiline_command("az group create \\\n  --name rg\n", 4);
        assert_eq!(indented, "az group create \\\n      --name rg\n");
    }
}
