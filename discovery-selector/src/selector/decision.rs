use std::fmt;

use url::Url;

/// A stage of the selection decision tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionStage {
    CheckShortCircuit,
    GetAllServices,
    FilterToAllowlist,
    FilterFromBlocklist,
    FilterOutKnownUnhealthy,
    GetSelectionRound,
    RoundFailedRetry,
    NoServicesLeftToTry,
    SelectedFromBackup,
    FailedAndResetting,
    MadeASelection,
}

/// One `(stage, value)` record of a selection run.
#[derive(Debug, Clone)]
pub struct Decision {
    pub stage: DecisionStage,
    pub val: Option<String>,
}

/// Ordered trace of every decision taken during a single `select()` call.
///
/// Logged alongside the selection result so that "why was this endpoint
/// (not) chosen" is reconstructible from logs alone.
#[derive(Debug, Clone, Default)]
pub(crate) struct DecisionTree {
    records: Vec<Decision>,
}

impl DecisionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: DecisionStage) {
        self.records.push(Decision { stage, val: None });
    }

    pub fn push_val(&mut self, stage: DecisionStage, val: impl Into<String>) {
        self.records.push(Decision {
            stage,
            val: Some(val.into()),
        });
    }

    pub fn push_urls(&mut self, stage: DecisionStage, urls: &[Url]) {
        let val = urls
            .iter()
            .map(Url::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        self.push_val(stage, format!("[{val}]"));
    }
}

impl fmt::Display for DecisionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            match &record.val {
                Some(val) => write!(f, "{:?}{}", record.stage, val)?,
                None => write!(f, "{:?}", record.stage)?,
            }
        }
        Ok(())
    }
}
