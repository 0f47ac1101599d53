use crate::error::CoreError;

use super::types::LabelRecord;

/// Parse a JSONL label file. Blank lines are skipped; the first malformed
/// line fails the whole file with its 1-based line number.
pub(super) fn parse_label_lines(file: &str, content: &str) -> Result<Vec<LabelRecord>, CoreError> {
    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| CoreError::EntityParse {
            file: file.to_owned(),
            line: index + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::types::LabelTarget;

    #[test]
    fn reads_records_around_blank_lines() {
        let content = [
            r#"{"type":"addr","ref":"bc1qexample","label":"Kraken hot wallet"}"#,
            "",
            "   ",
            r#"{"type":"xpub","ref":"xpub661M","label":"cold","spendable":false}"#,
            r#"{"type":"tx","ref":"ab12","label":"withdrawal","origin":"wpkh([d34db33f/84'/0'/0'])"}"#,
        ]
        .join("\n");
        let records = parse_label_lines("exchanges/kraken", &content).expect("labels parse");
        let targets: Vec<_> = records.iter().map(|r| r.target).collect();
        assert_eq!(targets, [LabelTarget::Addr, LabelTarget::Xpub, LabelTarget::Tx]);
        assert_eq!(records[0].reference, "bc1qexample");
        assert_eq!(records[2].origin.as_deref(), Some("wpkh([d34db33f/84'/0'/0'])"));
    }

    #[test]
    fn bad_line_reports_file_and_line() {
        let content = "{\"type\":\"addr\",\"ref\":\"a\",\"label\":\"x\"}\n\n{\"type\":\"utxo\"}\n";
        let Err(CoreError::EntityParse { file, line, .. }) =
            parse_label_lines("services/shop", content)
        else {
            panic!("unknown label type must be rejected");
        };
        assert_eq!(file, "services/shop");
        assert_eq!(line, 3);
    }
}
