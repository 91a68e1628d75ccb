use anyhow::{Context, Result, bail};
use encoding_rs::{Encoding, UTF_8};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use super::conversion::{Conversion, ConversionError};
use super::value::Value;
use crate::coordination::scheduler::Table;

/// Configuration for delimited file reading (CSV, TSV, etc.)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedConfig {
    pub delimiter: u8,
    pub has_header: bool,
    pub quote: u8,
    /// Text encoding of the file; must be ASCII-compatible
    pub encoding: &'static Encoding,
}

impl DelimitedConfig {
    /// Create from string representations
    pub fn from_strings(delimiter: &str, quote: &str) -> Result<Self> {
        let delimiter_byte = if delimiter == "\\t" || delimiter == "\t" {
            b'\t'
        } else if delimiter.len() == 1 {
            delimiter.as_bytes()[0]
        } else {
            bail!("Delimiter must be a single character or \\t");
        };

        let quote_byte = if quote.len() == 1 {
            quote.as_bytes()[0]
        } else {
            bail!("Quote must be a single character");
        };

        Ok(Self {
            delimiter: delimiter_byte,
            has_header: true,
            quote: quote_byte,
            encoding: UTF_8,
        })
    }

    pub fn with_encoding(self, encoding: &'static Encoding) -> Self {
        Self { encoding, ..self }
    }

    pub fn csv() -> Self {
        Self::default()
    }

    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            ..Self::default()
        }
    }
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            quote: b'"',
            encoding: UTF_8,
        }
    }
}

/// Look up a WHATWG encoding label such as `utf-8`, `latin1` or `windows-1252`
pub fn encoding_for_label(label: &str) -> Result<&'static Encoding> {
    let Some(encoding) = Encoding::for_label(label.trim().as_bytes()) else {
        bail!("Unknown encoding '{label}'");
    };
    if !encoding.is_ascii_compatible() {
        bail!("Encoding '{}' is not supported for delimited files", encoding.name());
    }
    Ok(encoding)
}

fn decode_record(record: &csv::ByteRecord, encoding: &'static Encoding) -> Result<Vec<String>> {
    record
        .iter()
        .enumerate()
        .map(|(i, field)| {
            encoding
                .decode_without_bom_handling_and_without_replacement(field)
                .map(Cow::into_owned)
                .with_context(|| format!("invalid {} in field {}", encoding.name(), i + 1))
        })
        .collect()
}

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Csv,
    Tsv,
    /// Plain text extract, tab-delimited unless configured otherwise
    Txt,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(Format::Csv),
            "tsv" => Ok(Format::Tsv),
            "txt" => Ok(Format::Txt),
            other => bail!(
                "Unsupported file extension '{}' for {}. Supported: csv, tsv, txt",
                other,
                path.display()
            ),
        }
    }

    /// Reader configuration for this format; an explicit delimiter wins
    pub fn delimited_config(&self, explicit: Option<&DelimitedConfig>) -> DelimitedConfig {
        match (explicit, self) {
            (Some(config), _) => config.clone(),
            (None, Format::Tsv | Format::Txt) => DelimitedConfig::tsv(),
            (None, Format::Csv) => DelimitedConfig::csv(),
        }
    }
}

/// Raw cells of a delimited file, keyed by header name
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub headers: Vec<String>,
    pub records: Vec<Vec<String>>,
}

impl Frame {
    /// Read an entire delimited file into memory, decoding every cell with
    /// the configured encoding
    pub fn read_delimited(path: &Path, config: &DelimitedConfig) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(config.delimiter)
            .quote(config.quote)
            .has_headers(config.has_header)
            .from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let headers = if config.has_header {
            let raw = reader.byte_headers().context("Failed to read header row")?;
            decode_record(raw, config.encoding)
                .with_context(|| format!("Failed to decode header row of {}", path.display()))?
                .iter()
                .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
                .collect()
        } else {
            Vec::new()
        };

        let mut records = Vec::new();
        let mut record = csv::ByteRecord::new();
        loop {
            let line = records.len() + 1;
            let more = reader
                .read_byte_record(&mut record)
                .with_context(|| format!("Failed to parse record {line} of {}", path.display()))?;
            if !more {
                break;
            }
            records.push(
                decode_record(&record, config.encoding)
                    .with_context(|| format!("Failed to decode record {line} of {}", path.display()))?,
            );
        }

        Ok(Self { headers, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Apply every conversion in `conversions` to its raw column.
    ///
    /// Columns with no conversion are dropped; a conversion whose raw column
    /// is absent from the file is a data fault. Blank cells become NULL.
    pub fn convert(&self, conversions: &BTreeMap<String, Conversion>) -> Result<TypedFrame, ConversionError> {
        let mut sources = Vec::with_capacity(conversions.len());
        for (raw_name, conversion) in conversions {
            let index = self
                .column_index(raw_name)
                .ok_or_else(|| ConversionError::MissingColumn(raw_name.clone()))?;
            sources.push((index, conversion));
        }

        let rows = self
            .records
            .iter()
            .map(|record| {
                sources
                    .iter()
                    .map(|(index, conversion)| {
                        conversion.apply(record.get(*index).map(String::as_str), Value::Null)
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TypedFrame {
            columns: conversions.keys().cloned().collect(),
            rows,
        })
    }
}

/// Converted rows, keyed by raw column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TypedFrame {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Positions of `table`'s raw columns within each row
    pub fn projection(&self, table: &Table) -> Result<Vec<usize>, ConversionError> {
        table
            .columns()
            .iter()
            .map(|col| {
                self.columns
                    .iter()
                    .position(|c| *c == col.raw_name)
                    .ok_or_else(|| ConversionError::MissingColumn(col.raw_name.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::scheduler::Column;
    use crate::db::SqlType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(suffix: &str, lines: &[&str]) -> NamedTempFile {
        let mut temp_file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        for line in lines {
            writeln!(temp_file, "{line}").unwrap();
        }
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn test_read_delimited() {
        let temp_file = write_file(".csv", &["id, name ,email", "1,Alice,alice@example.com", "2,Bob,"]);
        let frame = Frame::read_delimited(temp_file.path(), &DelimitedConfig::csv()).unwrap();

        assert_eq!(frame.headers, vec!["id", "name", "email"]);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.records[0][1], "Alice");
        assert_eq!(frame.records[1][2], "");
    }

    #[test]
    fn test_read_tab_delimited() {
        let temp_file = write_file(".txt", &["cas\tfda", "100\t20240105"]);
        let config = DelimitedConfig::from_strings("\\t", "\"").unwrap();
        let frame = Frame::read_delimited(temp_file.path(), &config).unwrap();
        assert_eq!(frame.headers, vec!["cas", "fda"]);
        assert_eq!(frame.records[0], vec!["100", "20240105"]);
    }

    #[test]
    fn test_read_latin1_cells() {
        let mut temp_file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        temp_file.write_all(b"id,name\n1,JOS\xc9\n").unwrap();
        temp_file.flush().unwrap();

        let err = Frame::read_delimited(temp_file.path(), &DelimitedConfig::csv()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid UTF-8 in field 2"));

        let latin1 = encoding_for_label("latin1").unwrap();
        let config = DelimitedConfig::csv().with_encoding(latin1);
        let frame = Frame::read_delimited(temp_file.path(), &config).unwrap();
        assert_eq!(frame.records[0], vec!["1", "JOS\u{c9}"]);
    }

    #[test]
    fn test_encoding_labels() {
        assert_eq!(encoding_for_label("UTF-8").unwrap(), UTF_8);
        assert_eq!(encoding_for_label("latin1").unwrap().name(), "windows-1252");
        assert!(encoding_for_label("klingon").is_err());
        assert!(encoding_for_label("utf-16le").is_err());
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(Format::from_path(Path::new("a/b.CSV")).unwrap(), Format::Csv);
        assert_eq!(Format::from_path(Path::new("x.txt")).unwrap(), Format::Txt);
        assert!(Format::from_path(Path::new("x.xlsx")).is_err());
        assert_eq!(Format::Txt.delimited_config(None).delimiter, b'\t');
        let pipe = DelimitedConfig::from_strings("|", "\"").unwrap();
        assert_eq!(Format::Txt.delimited_config(Some(&pipe)).delimiter, b'|');
    }

    #[test]
    fn test_convert_and_project() {
        let frame = Frame {
            headers: vec!["cas".into(), "fda".into(), "ignored".into()],
            records: vec![
                vec!["12".into(), "20240105".into(), "x".into()],
                vec!["13".into(), "".into(), "y".into()],
            ],
        };
        let mut conversions = BTreeMap::new();
        conversions.insert("cas".to_string(), Conversion::Integer);
        conversions.insert("fda".to_string(), Conversion::date("%Y%m%d"));

        let typed = frame.convert(&conversions).unwrap();
        assert_eq!(typed.columns, vec!["cas", "fda"]);
        assert_eq!(typed.rows[1], vec![Value::Integer(13), Value::Null]);

        let table = Table::new("cases")
            .column(Column::new("fda", "filing_date", SqlType::Date))
            .column(Column::new("cas", "id", SqlType::BigInt));
        assert_eq!(typed.projection(&table).unwrap(), vec![1, 0]);

        let missing = Table::new("other").column(Column::new("nope", "nope", SqlType::Text));
        assert_eq!(
            typed.projection(&missing),
            Err(ConversionError::MissingColumn("nope".to_string()))
        );
    }

    #[test]
    fn test_convert_missing_column_is_fatal() {
        let frame = Frame {
            headers: vec!["a".into()],
            records: vec![vec!["1".into()]],
        };
        let mut conversions = BTreeMap::new();
        conversions.insert("b".to_string(), Conversion::Text);
        assert_eq!(
            frame.convert(&conversions),
            Err(ConversionError::MissingColumn("b".to_string()))
        );
    }
}
