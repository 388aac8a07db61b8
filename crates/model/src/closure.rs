use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use track::{BlockNumber, Line};
use utility::id::{HasId, Id};

pub type ClosureId = Id<Closure>;

impl HasId for Closure {
    type IdType = String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClosureStatus {
    Scheduled,
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// Scheduled maintenance closure of one block, paired with an [`Opening`]
/// at its end time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Closure {
    pub id: ClosureId,
    pub line: Line,
    pub block: BlockNumber,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: ClosureStatus,
    pub created_at: DateTime<Utc>,
}

impl Closure {
    pub fn new(
        line: Line,
        block: BlockNumber,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let id = ClosureId::new(format!("{}_{}_{}", line, block, start.timestamp()));
        Self {
            id,
            line,
            block,
            start,
            end,
            status: ClosureStatus::Scheduled,
            created_at,
        }
    }

    pub fn opening(&self) -> Opening {
        Opening {
            closure_id: self.id.clone(),
            line: self.line,
            block: self.block,
            at: self.end,
        }
    }
}

/// The re-opening event paired with a scheduled closure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Opening {
    pub closure_id: ClosureId,
    pub line: Line,
    pub block: BlockNumber,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn closure_pairs_with_opening_at_end_time() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let end = start + Duration::hours(1);
        let closure = Closure::new(Line::Red, 12, start, end, start);
        assert_eq!(closure.status, ClosureStatus::Scheduled);
        let opening = closure.opening();
        assert_eq!(opening.at, end);
        assert_eq!(opening.block, 12);
        assert_eq!(opening.closure_id, closure.id);
    }
}
