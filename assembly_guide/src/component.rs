// THEORY:
// A checklist is produced once per calibration and only read afterwards, so it is
// an immutable shared slice. Replacing it is a pointer swap on the controller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The ordered, read-only component list produced by one calibration run.
pub type Checklist = Arc<[ComponentRecord]>;

/// One kind of component on the board: what it is called, how many of it must be
/// placed, and whether its orientation matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRecord {
    name: String,
    occurrences: u32,
    polarity: bool,
}

impl ComponentRecord {
    pub fn new(name: impl Into<String>, occurrences: u32, polarity: bool) -> Self {
        Self {
            name: name.into(),
            occurrences,
            polarity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn occurrences(&self) -> u32 {
        self.occurrences
    }

    pub fn has_polarity(&self) -> bool {
        self.polarity
    }
}

impl fmt::Display for ComponentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Component: {}", self.name)?;
        writeln!(f, "Occurrences: {}", self.occurrences)?;
        write!(f, "Polarity: {}", if self.polarity { "yes" } else { "no" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_the_info_block() {
        let record = ComponentRecord::new("R1", 2, true);

        assert_eq!(
            record.to_string(),
            "Component: R1\nOccurrences: 2\nPolarity: yes"
        );
    }

    #[test]
    fn deserializes_from_checklist_json() {
        let records: Vec<ComponentRecord> = serde_json::from_str(
            r#"[{"name":"C1","occurrences":1,"polarity":false}]"#,
        )
        .unwrap();

        assert_eq!(records, vec![ComponentRecord::new("C1", 1, false)]);
        assert!(!records[0].has_polarity());
    }
}
