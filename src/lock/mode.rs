use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

/// Represents the record lock modes.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    /// Two record modes are compatible iff both are shared.
    pub fn is_compatible(self, other: LockMode) -> bool {
        self == LockMode::Shared && other == LockMode::Shared
    }

    pub fn stronger_or_equal(self, other: LockMode) -> bool {
        match self {
            LockMode::Exclusive => true,
            LockMode::Shared => other == LockMode::Shared,
        }
    }
}

/// Represents the table lock modes.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Hash, EnumIter)]
pub enum TableMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    Exclusive,
    AutoInc,
}

impl TableMode {
    pub(crate) fn index(self) -> usize {
        use TableMode::*;
        match self {
            IntentionShared => 0,
            IntentionExclusive => 1,
            Shared => 2,
            Exclusive => 3,
            AutoInc => 4,
        }
    }

    pub fn is_intention(self) -> bool {
        matches!(self, TableMode::IntentionShared | TableMode::IntentionExclusive)
    }

    /// Partial strength order over table modes.
    ///
    /// X covers everything; S covers S/IS; IX covers IX/IS; AUTO_INC only itself.
    pub fn stronger_or_equal(self, other: TableMode) -> bool {
        use TableMode::*;
        match self {
            Exclusive => true,
            Shared => matches!(other, Shared | IntentionShared),
            IntentionExclusive => matches!(other, IntentionExclusive | IntentionShared),
            IntentionShared => other == IntentionShared,
            AutoInc => other == AutoInc,
        }
    }
}

/// Represents what a record lock covers relative to its row.
///
/// `NextKey` is the ordinary lock: the row plus the gap before it. `Gap` and
/// `InsertIntention` lock only the open interval before the row; insert
/// intention additionally signals intent to insert into that gap.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum Precision {
    NextKey,
    Gap,
    RecNotGap,
    InsertIntention,
}

impl Precision {
    /// Whether the lock covers only the gap, never the row itself.
    pub fn is_gap_only(self) -> bool {
        matches!(self, Precision::Gap | Precision::InsertIntention)
    }

    /// Whether the lock covers the row itself.
    pub fn covers_record(self) -> bool {
        matches!(self, Precision::NextKey | Precision::RecNotGap)
    }

    /// Whether the lock covers the gap before the row.
    pub fn covers_gap(self) -> bool {
        matches!(
            self,
            Precision::NextKey | Precision::Gap | Precision::InsertIntention
        )
    }

    /// Whether a lock of this precision makes a request of precision `req`
    /// redundant. Insert intention never stands in for anything else.
    pub fn subsumes(self, req: Precision) -> bool {
        if self == Precision::InsertIntention || req == Precision::InsertIntention {
            return self == req;
        }
        (self.covers_record() || !req.covers_record())
            && (self.covers_gap() || !req.covers_gap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_mode_test() {
        assert!(LockMode::Shared.is_compatible(LockMode::Shared));
        assert!(!LockMode::Shared.is_compatible(LockMode::Exclusive));
        assert!(!LockMode::Exclusive.is_compatible(LockMode::Exclusive));

        assert!(LockMode::Exclusive.stronger_or_equal(LockMode::Shared));
        assert!(!LockMode::Shared.stronger_or_equal(LockMode::Exclusive));
    }

    #[test]
    fn table_mode_strength_test() {
        use TableMode::*;

        assert!(Exclusive.stronger_or_equal(AutoInc));
        assert!(Shared.stronger_or_equal(IntentionShared));
        assert!(!Shared.stronger_or_equal(IntentionExclusive));
        assert!(IntentionExclusive.stronger_or_equal(IntentionShared));
        assert!(!AutoInc.stronger_or_equal(IntentionShared));
    }

    #[test]
    fn precision_test() {
        assert!(Precision::Gap.is_gap_only());
        assert!(Precision::InsertIntention.is_gap_only());
        assert!(!Precision::NextKey.is_gap_only());
        assert!(Precision::NextKey.covers_record());
        assert!(Precision::NextKey.covers_gap());
        assert!(!Precision::RecNotGap.covers_gap());

        assert!(Precision::NextKey.subsumes(Precision::Gap));
        assert!(Precision::NextKey.subsumes(Precision::RecNotGap));
        assert!(!Precision::Gap.subsumes(Precision::NextKey));
        assert!(!Precision::RecNotGap.subsumes(Precision::Gap));
        assert!(Precision::InsertIntention.subsumes(Precision::InsertIntention));
        assert!(!Precision::NextKey.subsumes(Precision::InsertIntention));
    }
}
