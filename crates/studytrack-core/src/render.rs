use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::task::Task;

pub const WAKING_UP_NOTICE: &str = "Waking up server: tasks could not be loaded yet. \
     Add a task or run the command again in a minute.";

#[derive(Debug, Clone)]
pub struct Renderer {
    styled: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self {
            styled: color && io::stdout().is_terminal(),
        })
    }

    /// Writes `visible` with each row numbered by its place in `all`.
    #[tracing::instrument(skip_all, fields(count = visible.len()))]
    pub fn write_tasks<W: Write>(
        &self,
        out: &mut W,
        all: &[Task],
        visible: &[&Task],
    ) -> anyhow::Result<()> {
        if visible.is_empty() {
            writeln!(out, "No tasks.")?;
            return Ok(());
        }
        write_task_table(out, all, visible, self.styled)
    }

    pub fn write_notice<W: Write>(&self, out: &mut W, message: &str) -> anyhow::Result<()> {
        writeln!(out, "{message}")?;
        Ok(())
    }
}

fn write_task_table<W: Write>(
    writer: &mut W,
    all: &[Task],
    visible: &[&Task],
    styled: bool,
) -> anyhow::Result<()> {
    let headers = ["#", "Done", "Title", "ID"];
    let rows: Vec<[String; 4]> = visible
        .iter()
        .map(|task| {
            let position = all
                .iter()
                .position(|t| t.id == task.id)
                .map(|idx| (idx + 1).to_string())
                .unwrap_or_else(|| "-".to_string());
            let check = if task.done { "[x]" } else { "[ ]" };
            [
                position,
                check.to_string(),
                task.title.clone(),
                task.id.to_string(),
            ]
        })
        .collect();

    let mut widths = headers.map(|header| UnicodeWidthStr::width(header));
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(UnicodeWidthStr::width(cell.as_str()));
        }
    }

    for (header, width) in headers.iter().zip(widths) {
        write!(writer, "{header:width$} ")?;
    }
    writeln!(writer)?;
    for width in widths {
        write!(writer, "{:-<width$} ", "")?;
    }
    writeln!(writer)?;

    for (row, task) in rows.iter().zip(visible) {
        for (idx, (cell, width)) in row.iter().zip(widths).enumerate() {
            let padding = width.saturating_sub(UnicodeWidthStr::width(cell.as_str()));
            let shown = if styled && task.done && idx == 2 {
                format!("\x1b[9;2m{cell}\x1b[0m")
            } else {
                cell.clone()
            };
            write!(writer, "{shown}{} ", " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}
