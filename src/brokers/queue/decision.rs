//! Decision: the value every delivery-handler hook returns.
//!
//! Fan-out produces one decision per consumer. They are folded into a single
//! decision per message with `merge`, where the most restrictive answer wins:
//! - `allow` is false if any participant disallowed
//! - any put-back beats `No`, and `Regular` beats `End`
//! - `Failed` beats `Commit`, which beats `None`
//! - the `save`/`keep` intents are sticky

use serde::{Deserialize, Serialize};

/// Whether (and where) a message re-enters its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PutBack {
    #[default]
    No,
    /// Back to the tail of the list the message came from.
    Regular,
    /// Back to the tail of the regular list, behind everything else.
    End,
}

impl PutBack {
    fn rank(self) -> u8 {
        match self {
            PutBack::No => 0,
            PutBack::End => 1,
            PutBack::Regular => 2,
        }
    }
}

impl std::str::FromStr for PutBack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "no" | "none" => Ok(PutBack::No),
            "regular" => Ok(PutBack::Regular),
            "end" => Ok(PutBack::End),
            other => Err(format!("unknown put-back policy '{}'", other)),
        }
    }
}

/// Outcome reported back to the producer of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Transmission {
    #[default]
    None,
    Commit,
    Failed,
}

impl Transmission {
    fn rank(self) -> u8 {
        match self {
            Transmission::None => 0,
            Transmission::Commit => 1,
            Transmission::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    /// The handler stored (or wants to store) the message.
    pub save: bool,
    /// The handler wants the stored copy kept after this step.
    pub keep: bool,
    pub put_back: PutBack,
    pub transmission: Transmission,
}

impl Default for Decision {
    fn default() -> Self {
        Self::allow()
    }
}

impl Decision {
    pub const fn allow() -> Self {
        Self {
            allow: true,
            save: false,
            keep: false,
            put_back: PutBack::No,
            transmission: Transmission::None,
        }
    }

    pub const fn deny() -> Self {
        Self {
            allow: false,
            save: false,
            keep: false,
            put_back: PutBack::No,
            transmission: Transmission::None,
        }
    }

    pub fn with_put_back(mut self, put_back: PutBack) -> Self {
        self.put_back = put_back;
        self
    }

    pub fn with_transmission(mut self, transmission: Transmission) -> Self {
        self.transmission = transmission;
        self
    }

    pub fn saved(mut self) -> Self {
        self.save = true;
        self
    }

    pub fn kept(mut self) -> Self {
        self.keep = true;
        self
    }

    pub fn merge(self, other: Decision) -> Decision {
        Decision {
            allow: self.allow && other.allow,
            save: self.save || other.save,
            keep: self.keep || other.keep,
            put_back: if other.put_back.rank() > self.put_back.rank() {
                other.put_back
            } else {
                self.put_back
            },
            transmission: if other.transmission.rank() > self.transmission.rank() {
                other.transmission
            } else {
                self.transmission
            },
        }
    }
}

/// Folds any number of decisions. An empty input folds to `Decision::allow()`.
pub fn fold<I>(decisions: I) -> Decision
where
    I: IntoIterator<Item = Decision>,
{
    decisions.into_iter().fold(Decision::allow(), Decision::merge)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_deny_wins() {
        let merged = fold([Decision::allow(), Decision::deny(), Decision::allow()]);
        assert!(!merged.allow);
    }

    #[test]
    fn test_put_back_prefers_conservative_value() {
        let merged = fold([
            Decision::allow(),
            Decision::allow().with_put_back(PutBack::End),
        ]);
        assert_eq!(merged.put_back, PutBack::End);

        let merged = merged.merge(Decision::allow().with_put_back(PutBack::Regular));
        assert_eq!(merged.put_back, PutBack::Regular);

        // Order does not matter
        let reversed = Decision::allow()
            .with_put_back(PutBack::Regular)
            .merge(Decision::allow().with_put_back(PutBack::End));
        assert_eq!(reversed.put_back, PutBack::Regular);
    }

    #[test]
    fn test_transmission_failed_beats_commit() {
        let merged = fold([
            Decision::allow().with_transmission(Transmission::Commit),
            Decision::allow().with_transmission(Transmission::Failed),
            Decision::allow(),
        ]);
        assert_eq!(merged.transmission, Transmission::Failed);

        let merged = fold([
            Decision::allow(),
            Decision::allow().with_transmission(Transmission::Commit),
        ]);
        assert_eq!(merged.transmission, Transmission::Commit);
    }

    #[test]
    fn test_empty_fold_is_allow() {
        assert_eq!(fold(Vec::new()), Decision::allow());
    }

    #[test]
    fn test_intents_are_sticky() {
        let merged = Decision::allow().saved().merge(Decision::allow().kept());
        assert!(merged.save);
        assert!(merged.keep);
    }

    #[test]
    fn test_put_back_parse() {
        assert_eq!("Regular".parse::<PutBack>().unwrap(), PutBack::Regular);
        assert_eq!("no".parse::<PutBack>().unwrap(), PutBack::No);
        assert!("sideways".parse::<PutBack>().is_err());
    }
}
