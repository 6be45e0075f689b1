use regex::{Regex, RegexBuilder};

use crate::types::ThreatType;

/// Compiled regex catalog used to pre-screen request bodies before any model
/// call. Matching is case-insensitive throughout.
pub struct ThreatPatterns {
    groups: Vec<(ThreatType, Vec<Regex>)>,
}

impl ThreatPatterns {
    pub fn new() -> Self {
        Self {
            groups: vec![
                (
                    ThreatType::PromptInjection,
                    compile(&[
                        r"ignore (all )?previous instructions",
                        r"disregard (the )?above",
                        r"forget (everything|what) (you|i) (told|said)",
                        r"you are now a",
                        r"pretend (you're|to be)",
                        r"act as (if|though)",
                        r"system\s*:",
                        r"\[INST\]",
                        r"<<SYS>>",
                    ]),
                ),
                (
                    ThreatType::DataExfiltration,
                    compile(&[
                        r"show me (all|the) (users|passwords|secrets|keys|tokens)",
                        r"dump (the )?(database|db|table)",
                        r"export all",
                        r"list (all )?(api )?keys",
                    ]),
                ),
                (
                    ThreatType::PrivilegeEscalation,
                    compile(&[
                        r"grant (me )?admin",
                        r"make me (an? )?admin",
                        r"elevate (my )?privileges",
                        r"sudo",
                        r"root access",
                    ]),
                ),
                (
                    ThreatType::CommandInjection,
                    compile(&[
                        r"; ?(rm|del|drop|truncate|delete) ",
                        r"\| ?(bash|sh|cmd|powershell)",
                        r"`[^`]+`",
                        r"\$\([^)]+\)",
                    ]),
                ),
            ],
        }
    }

    /// Returns the threat types whose patterns fire on `text`, in catalog
    /// order, each at most once.
    pub fn scan(&self, text: &str) -> Vec<ThreatType> {
        self.groups
            .iter()
            .filter(|(_, patterns)| patterns.iter().any(|pattern| pattern.is_match(text)))
            .map(|(threat, _)| *threat)
            .collect()
    }
}

impl Default for ThreatPatterns {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .map(|source| {
            RegexBuilder::new(source)
                .case_insensitive(true)
                .build()
                .expect("threat pattern compiles")
        })
        .collect()
}
