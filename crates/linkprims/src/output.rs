use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Print `value` as one JSON line, or `header`/`rows` as a table, or one
/// `key=value` line per row.
pub fn print_rows<T: Serialize>(value: &T, header: &[&str], rows: Vec<Vec<String>>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(header.to_vec());
            for row in rows {
                table.add_row(row);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for row in rows {
                let line: Vec<String> = header
                    .iter()
                    .zip(row)
                    .map(|(key, value)| format!("{}={value}", key.to_ascii_lowercase()))
                    .collect();
                println!("{}", line.join(" "));
            }
        }
    }
}

pub fn hex_preview(data: &[u8], limit: usize) -> String {
    let mut out: String = data.iter().take(limit).map(|b| format!("{b:02X}")).collect();
    if data.len() > limit {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_preview_truncates() {
        assert_eq!(hex_preview(&[0x1A, 0xCF], 4), "1ACF");
        assert_eq!(hex_preview(&[1, 2, 3], 2), "0102...");
    }
}
