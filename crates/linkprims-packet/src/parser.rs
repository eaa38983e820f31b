use std::collections::HashMap;
use std::path::Path;

use linkprims_accessor::{BinaryAccessor, DataType, Value};

use crate::error::ConfigError;

/// One keyword line of a config file.
///
/// Parameters have their surrounding quotes removed; `quoted` records which
/// ones were quoted so callers can tell `0xABCD` from `"0xABCD"`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLine {
    pub keyword: String,
    pub params: Vec<String>,
    pub quoted: Vec<bool>,
    pub filename: String,
    pub line_number: usize,
    pub line: String,
}

impl ConfigLine {
    /// Build an error located at this line.
    pub fn error(&self, message: impl Into<String>, usage: impl Into<String>) -> ConfigError {
        ConfigError {
            message: message.into(),
            filename: self.filename.clone(),
            line_number: self.line_number,
            line: self.line.clone(),
            usage: usage.into(),
        }
    }

    /// Check the parameter count. `max = None` means unbounded.
    pub fn verify_num_parameters(
        &self,
        min: usize,
        max: Option<usize>,
        usage: &str,
    ) -> Result<(), ConfigError> {
        if self.params.len() < min {
            return Err(self.error(format!("Not enough parameters for {}.", self.keyword), usage));
        }
        if let Some(max) = max {
            if self.params.len() > max {
                return Err(self.error(format!("Too many parameters for {}.", self.keyword), usage));
            }
        }
        Ok(())
    }

    /// Reject names that collide with reserved characters. `index` is 1-based.
    pub fn verify_parameter_naming(&self, index: usize, usage: &str) -> Result<(), ConfigError> {
        let Some(param) = self.params.get(index - 1) else {
            return Ok(());
        };
        let problem = if param.ends_with('_') {
            Some("cannot end with an underscore ('_')")
        } else if param.contains("__") {
            Some("cannot contain a double underscore ('__')")
        } else if param.contains("[[") || param.contains("]]") {
            Some("cannot contain double brackets ('[[' or ']]')")
        } else if param.contains(' ') {
            Some("cannot contain a space (' ')")
        } else if param.contains('\'') || param.contains('"') {
            Some("cannot contain a quote (' or \")")
        } else if param.contains('{') || param.contains('}') {
            Some("cannot contain a curly bracket ('{' or '}')")
        } else {
            None
        };
        match problem {
            Some(problem) => Err(self.error(
                format!(
                    "Parameter {index} ({param}) for {} {problem}.",
                    self.keyword
                ),
                usage,
            )),
            None => Ok(()),
        }
    }

    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn is_quoted(&self, index: usize) -> bool {
        self.quoted.get(index).copied().unwrap_or(false)
    }
}

/// Reader for the line-oriented config formats.
///
/// - tokens are whitespace separated or single/double quoted
/// - `#` starts a comment, including trailing comments
/// - a trailing `&` continues the line
/// - a quoted string ending in `+` or `\` continues on the next line (`+`
///   keeps a newline)
/// - `<%= name %>` is replaced by the value of a variable
#[derive(Debug, Clone, Default)]
pub struct ConfigParser {
    variables: HashMap<String, String>,
}

impl ConfigParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    /// Parse a file into its keyword lines.
    pub fn parse_file(&self, path: &Path) -> Result<Vec<ConfigLine>, ConfigError> {
        let filename = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError {
            message: format!("Configuration file {filename} could not be read: {err}"),
            filename: filename.clone(),
            line_number: 0,
            line: String::new(),
            usage: String::new(),
        })?;
        self.parse_str(&text, &filename)
    }

    /// Parse config text. `filename` is only used for error locations.
    pub fn parse_str(&self, text: &str, filename: &str) -> Result<Vec<ConfigLine>, ConfigError> {
        let mut lines = Vec::new();
        let mut pending = String::new();
        let mut string_concat = false;

        for (index, raw) in text.lines().enumerate() {
            let line_number = index + 1;
            let mut line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if string_concat {
                if line.starts_with('#') {
                    continue;
                }
                // Drop the opening quote of the continued string.
                line = line.strip_prefix(['"', '\'']).unwrap_or(line);
            }

            match line.chars().last() {
                Some(c @ ('+' | '\\')) => {
                    let trimmed = line[..line.len() - 1].trim_end();
                    // Drop the closing quote so the string flows into the next line.
                    let mut chars = trimmed.chars();
                    chars.next_back();
                    pending.push_str(chars.as_str());
                    if c == '+' {
                        pending.push('\n');
                    }
                    string_concat = true;
                    continue;
                }
                Some('&') => {
                    pending.push_str(&line[..line.len() - 1]);
                    continue;
                }
                _ => pending.push_str(line),
            }
            string_concat = false;

            let full = std::mem::take(&mut pending);
            let full = substitute_variables(&full, &self.variables).map_err(|message| {
                ConfigError {
                    message,
                    filename: filename.to_string(),
                    line_number,
                    line: full.clone(),
                    usage: String::new(),
                }
            })?;

            let tokens = tokenize(&full);
            let Some((first, first_quoted)) = tokens.first() else {
                continue;
            };
            if !first_quoted && first.starts_with('#') {
                continue;
            }

            let mut params = Vec::new();
            let mut quoted = Vec::new();
            for (token, was_quoted) in tokens.iter().skip(1) {
                if !was_quoted && token.starts_with('#') && !token.starts_with("#{") {
                    break;
                }
                params.push(token.clone());
                quoted.push(*was_quoted);
            }

            lines.push(ConfigLine {
                keyword: first.to_ascii_uppercase(),
                params,
                quoted,
                filename: filename.to_string(),
                line_number,
                line: full,
            });
        }
        Ok(lines)
    }
}

/// Split a line into `(token, was_quoted)` pairs with quotes removed.
fn tokenize(line: &str) -> Vec<(String, bool)> {
    let chars: Vec<char> = line.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        if chars[i] == '"' || chars[i] == '\'' {
            let quote = chars[i];
            let mut j = i + 1;
            let mut closed = None;
            while j < chars.len() {
                if chars[j] == '\\' {
                    j += 2;
                    continue;
                }
                if chars[j] == quote {
                    closed = Some(j);
                    break;
                }
                j += 1;
            }
            if let Some(end) = closed {
                tokens.push((chars[i + 1..end].iter().collect(), true));
                i = end + 1;
                continue;
            }
        }
        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() {
            i += 1;
        }
        tokens.push((chars[start..i].iter().collect(), false));
    }
    tokens
}

/// Replace every `<%= name %>` with its variable value.
pub fn substitute_variables(
    text: &str,
    variables: &HashMap<String, String>,
) -> Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<%=") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let Some(end) = after.find("%>") else {
            return Err("Unterminated <%= %> substitution".to_string());
        };
        let name = after[..end].trim();
        match variables.get(name) {
            Some(value) => out.push_str(value),
            None => return Err(format!("Unknown variable '{name}'")),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// `""`, `NONE`, `NULL` and `NIL` mean "no value".
pub fn handle_none(value: &str) -> Option<&str> {
    match value.to_ascii_uppercase().as_str() {
        "" | "NONE" | "NULL" | "NIL" => None,
        _ => Some(value),
    }
}

pub fn handle_true_false(value: &str) -> Option<bool> {
    match value.to_ascii_uppercase().as_str() {
        "TRUE" => Some(true),
        "FALSE" => Some(false),
        _ => None,
    }
}

/// Parse an integer literal: decimal, `0x` hex, `0b` binary or `0o` octal,
/// with optional sign and `_` separators.
pub fn parse_int(value: &str) -> Option<i128> {
    let cleaned: String = value.trim().chars().filter(|c| *c != '_').collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
    };
    let lower = digits.to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        i128::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i128::from_str_radix(bin, 2).ok()
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i128::from_str_radix(oct, 8).ok()
    } else if !lower.is_empty() && lower.chars().all(|c| c.is_ascii_digit()) {
        lower.parse::<i128>().ok()
    } else {
        None
    }?;
    Some(if negative { -parsed } else { parsed })
}

/// Best-effort conversion of a config string into an integer, float or string.
pub fn convert_to_value(value: &str) -> Value {
    if let Some(v) = parse_int(value) {
        return Value::Int(v);
    }
    if let Ok(f) = value.trim().parse::<f64>() {
        if !value.trim().is_empty() {
            return Value::Float(f);
        }
    }
    Value::String(value.to_string())
}

/// Decode `0x`-prefixed hex into bytes. An odd digit count is left padded.
pub fn hex_to_bytes(value: &str) -> Option<Vec<u8>> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let padded = if digits.len() % 2 == 1 {
        format!("0{digits}")
    } else {
        digits.to_string()
    };
    (0..padded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&padded[i..i + 2], 16).ok())
        .collect()
}

/// Resolve the named range constants (`MIN`, `MAX`, `MAX_UINT16`,
/// `NEG_INFINITY`, ...). Other values go through [`convert_to_value`].
pub fn handle_defined_constants(value: &str, data_type: DataType, bit_size: i64) -> Value {
    let int = |v: i128| Value::Int(v);
    match value.to_ascii_uppercase().as_str() {
        "MIN" | "MAX" => {
            let max = value.eq_ignore_ascii_case("MAX");
            match data_type {
                DataType::Int | DataType::Uint if (1..=64).contains(&bit_size) => {
                    let (min_v, max_v, _) = BinaryAccessor::overflow_range(bit_size, data_type);
                    let (min_v, max_v) = if data_type == DataType::Int && bit_size == 1 {
                        (-1, 0)
                    } else {
                        (min_v, max_v)
                    };
                    int(if max { max_v } else { min_v })
                }
                DataType::Float if bit_size == 32 => {
                    Value::Float(if max { 3.402823e38 } else { -3.402823e38 })
                }
                DataType::Float => Value::Float(if max { f64::MAX } else { -f64::MAX }),
                _ => Value::String(value.to_string()),
            }
        }
        "MIN_INT8" => int(i8::MIN as i128),
        "MAX_INT8" => int(i8::MAX as i128),
        "MIN_INT16" => int(i16::MIN as i128),
        "MAX_INT16" => int(i16::MAX as i128),
        "MIN_INT32" => int(i32::MIN as i128),
        "MAX_INT32" => int(i32::MAX as i128),
        "MIN_INT64" => int(i64::MIN as i128),
        "MAX_INT64" => int(i64::MAX as i128),
        "MIN_UINT8" | "MIN_UINT16" | "MIN_UINT32" | "MIN_UINT64" => int(0),
        "MAX_UINT8" => int(u8::MAX as i128),
        "MAX_UINT16" => int(u16::MAX as i128),
        "MAX_UINT32" => int(u32::MAX as i128),
        "MAX_UINT64" => int(u64::MAX as i128),
        "MIN_FLOAT32" => Value::Float(-3.402823e38),
        "MAX_FLOAT32" => Value::Float(3.402823e38),
        "MIN_FLOAT64" => Value::Float(-f64::MAX),
        "MAX_FLOAT64" => Value::Float(f64::MAX),
        "POS_INFINITY" => Value::Float(f64::INFINITY),
        "NEG_INFINITY" => Value::Float(f64::NEG_INFINITY),
        _ => convert_to_value(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<ConfigLine> {
        ConfigParser::new().parse_str(text, "test.txt").unwrap()
    }

    #[test]
    fn test_keywords_quotes_and_comments() {
        let lines = parse(
            "# header comment\n\n  keyword PARAM1 \"two words\" 'single' # trailing\nOTHER\n",
        );
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].keyword, "KEYWORD");
        assert_eq!(lines[0].params, vec!["PARAM1", "two words", "single"]);
        assert_eq!(lines[0].quoted, vec![false, true, true]);
        assert_eq!(lines[0].line_number, 3);
        assert_eq!(lines[1].keyword, "OTHER");
        assert!(lines[1].params.is_empty());
    }

    #[test]
    fn test_line_continuation() {
        let lines = parse("KEYWORD P1 &\n  P2 P3\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].params, vec!["P1", "P2", "P3"]);
        assert_eq!(lines[0].line_number, 2);
    }

    #[test]
    fn test_string_concatenation() {
        let lines = parse("KEYWORD \"first \" +\n  \"second\"\nNEXT 'a' \\\n 'b'\n");
        assert_eq!(lines[0].params, vec!["first \nsecond"]);
        assert_eq!(lines[1].params, vec!["ab"]);
    }

    #[test]
    fn test_continued_string_with_multibyte_start() {
        let lines = parse("DESCRIPTION \"abc\" +\n\u{e9}t\u{e9}\"\n");
        assert_eq!(lines[0].params, vec!["abc\n\u{e9}t\u{e9}"]);
    }

    #[test]
    fn test_variable_substitution() {
        let mut vars = HashMap::new();
        vars.insert("port".to_string(), "8080".to_string());
        let parser = ConfigParser::with_variables(vars);
        let lines = parser.parse_str("PORT <%= port %>\n", "vars.txt").unwrap();
        assert_eq!(lines[0].params, vec!["8080"]);

        let err = parser.parse_str("PORT <%= missing %>\n", "vars.txt").unwrap_err();
        assert_eq!(err.message, "Unknown variable 'missing'");
        assert_eq!(err.line_number, 1);
    }

    #[test]
    fn test_verify_num_parameters_messages() {
        let lines = parse("KEY A B C\n");
        let err = lines[0].verify_num_parameters(4, None, "KEY <A>").unwrap_err();
        assert_eq!(err.message, "Not enough parameters for KEY.");
        let err = lines[0].verify_num_parameters(1, Some(2), "KEY <A>").unwrap_err();
        assert_eq!(err.message, "Too many parameters for KEY.");
        assert!(err.to_string().starts_with("test.txt:1: Too many parameters"));
        lines[0].verify_num_parameters(3, Some(3), "").unwrap();
    }

    #[test]
    fn test_parameter_naming() {
        let lines = parse("ITEM BAD_ 0\nITEM A__B 0\nITEM GOOD 0\n");
        assert!(lines[0].verify_parameter_naming(1, "").is_err());
        assert!(lines[1].verify_parameter_naming(1, "").is_err());
        assert!(lines[2].verify_parameter_naming(1, "").is_ok());
    }

    #[test]
    fn test_value_helpers() {
        assert_eq!(parse_int("0x1F"), Some(31));
        assert_eq!(parse_int("-0b101"), Some(-5));
        assert_eq!(parse_int("1_000"), Some(1000));
        assert_eq!(parse_int("1.5"), None);
        assert_eq!(convert_to_value("2.5"), Value::Float(2.5));
        assert_eq!(convert_to_value("abc"), Value::String("abc".to_string()));
        assert_eq!(hex_to_bytes("0xABC"), Some(vec![0x0A, 0xBC]));
        assert_eq!(hex_to_bytes("0xZZ"), None);
        assert_eq!(handle_none("nil"), None);
        assert_eq!(handle_true_false("True"), Some(true));
    }

    #[test]
    fn test_defined_constants() {
        assert_eq!(
            handle_defined_constants("MAX", DataType::Uint, 12),
            Value::Int(4095)
        );
        assert_eq!(
            handle_defined_constants("MIN", DataType::Int, 8),
            Value::Int(-128)
        );
        assert_eq!(
            handle_defined_constants("MAX_UINT16", DataType::Uint, 16),
            Value::Int(65535)
        );
        assert_eq!(
            handle_defined_constants("12", DataType::Uint, 16),
            Value::Int(12)
        );
    }
}
