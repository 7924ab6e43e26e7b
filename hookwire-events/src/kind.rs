use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Kind of program attached to a hook.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Runs when the hooked function is entered.
    Entry,
    /// Runs when the hooked function returns.
    Exit,
    /// Runs as the hook itself (e.g. an XDP program on an interface).
    Standalone,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Entry => "entry",
            ProbeKind::Exit => "exit",
            ProbeKind::Standalone => "standalone",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "entry" | "fentry" => ProbeKind::Entry,
            "exit" | "fexit" => ProbeKind::Exit,
            "standalone" | "xdp" => ProbeKind::Standalone,
            x => return Err(format!("unknown probe kind '{x}'")),
        })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("entry" => Ok(ProbeKind::Entry))]
    #[test_case("fexit" => Ok(ProbeKind::Exit))]
    #[test_case("xdp" => Ok(ProbeKind::Standalone))]
    #[test_case("kprobe" => Err("unknown probe kind 'kprobe'".to_string()))]
    fn parse(input: &str) -> Result<ProbeKind, String> {
        input.parse()
    }

    #[test]
    fn serde_names() {
        assert_eq!(
            serde_json::to_string(&ProbeKind::Standalone).unwrap(),
            "\"standalone\""
        );
        let kind: ProbeKind = serde_json::from_str("\"exit\"").unwrap();
        assert_eq!(kind, ProbeKind::Exit);
    }
}
