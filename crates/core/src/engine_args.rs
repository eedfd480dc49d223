//! Argument vectors for the cracking engine.
//!
//! The engine is always invoked with an explicit argument list, never via a
//! shell string. Paths passed here must already have been through
//! [`path_safety::validate`](crate::path_safety::validate).

use std::ffi::OsString;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::DbId;

/// Straight (dictionary) attack.
const ATTACK_TYPE_STRAIGHT: &str = "0";

/// Output lines are `hash:plain`; see [`crate::credentials`].
const OUTFILE_FORMAT: &str = "--outfile-format=1,2";

/// Hash modes the platform supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMode {
    /// WPA-PBKDF2-PMKID+EAPOL (mode 22000).
    WpaPbkdf2,
    /// WPA-PMK-PMKID+EAPOL (mode 22001), attacked with precomputed PMKs.
    WpaPmk,
}

impl HashMode {
    /// Numeric selector passed after `-m`.
    pub fn selector(self) -> u32 {
        match self {
            Self::WpaPbkdf2 => 22000,
            Self::WpaPmk => 22001,
        }
    }

    /// Parse the numeric selector stored on a job record.
    pub fn from_selector(value: i32) -> Result<Self, CoreError> {
        match value {
            22000 => Ok(Self::WpaPbkdf2),
            22001 => Ok(Self::WpaPmk),
            other => Err(CoreError::Validation(format!(
                "Unsupported hash mode: {other}"
            ))),
        }
    }

    /// Delimiter-separated fields in a cracked hash line of this mode:
    /// `mic:mac_ap:mac_sta:essid` for both WPA modes.
    pub fn identifier_fields(self) -> usize {
        match self {
            Self::WpaPbkdf2 | Self::WpaPmk => 4,
        }
    }
}

/// Everything needed to build one engine invocation.
#[derive(Debug, Clone)]
pub struct AttackInvocation {
    pub job_id: DbId,
    pub hash_mode: HashMode,
    pub max_runtime_secs: u64,
    pub status_timer_secs: u64,
    pub output_file: PathBuf,
    pub state_file: PathBuf,
    pub hash_file: PathBuf,
    pub wordlist: PathBuf,
}

impl AttackInvocation {
    /// Engine session name; unique per job so restore files never collide.
    pub fn session_name(&self) -> String {
        format!("crackq-job-{}", self.job_id)
    }

    /// Build the argument vector in the order the engine contract requires:
    /// mode, attack type, flags, runtime ceiling, session, output and state
    /// files, then the two inputs.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-m".into(),
            self.hash_mode.selector().to_string().into(),
            "-a".into(),
            ATTACK_TYPE_STRAIGHT.into(),
            "--quiet".into(),
            "--force".into(),
            "-O".into(),
            "--status".into(),
            format!("--status-timer={}", self.status_timer_secs.max(1)).into(),
            format!("--runtime={}", self.max_runtime_secs.max(1)).into(),
            format!("--session={}", self.session_name()).into(),
            OUTFILE_FORMAT.into(),
            "-o".into(),
        ];
        args.push(self.output_file.clone().into_os_string());
        args.push("--potfile-path".into());
        args.push(self.state_file.clone().into_os_string());
        args.push(self.hash_file.clone().into_os_string());
        args.push(self.wordlist.clone().into_os_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> AttackInvocation {
        AttackInvocation {
            job_id: 42,
            hash_mode: HashMode::WpaPbkdf2,
            max_runtime_secs: 3600,
            status_timer_secs: 5,
            output_file: PathBuf::from("/work/job-42.out"),
            state_file: PathBuf::from("/work/job-42.pot"),
            hash_file: PathBuf::from("/data/captures/net; rm -rf ~.hc22000"),
            wordlist: PathBuf::from("/data/dicts/rockyou.txt"),
        }
    }

    #[test]
    fn args_follow_engine_contract_order() {
        let args = invocation().to_args();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&args[..4], &["-m", "22000", "-a", "0"]);
        assert!(args.contains(&"--runtime=3600".to_string()));
        assert!(args.contains(&"--session=crackq-job-42".to_string()));
        let n = args.len();
        assert_eq!(args[n - 2], "/data/captures/net; rm -rf ~.hc22000");
        assert_eq!(args[n - 1], "/data/dicts/rockyou.txt");
    }

    #[test]
    fn hostile_file_name_stays_a_single_argument() {
        let args = invocation().to_args();
        assert_eq!(
            args.iter()
                .filter(|a| a.to_string_lossy().contains("rm -rf"))
                .count(),
            1
        );
    }

    #[test]
    fn output_and_state_files_are_separate() {
        let args = invocation().to_args();
        let out = args.iter().position(|a| a == "-o").expect("-o present");
        let pot = args
            .iter()
            .position(|a| a == "--potfile-path")
            .expect("--potfile-path present");
        assert_eq!(args[out + 1], "/work/job-42.out");
        assert_eq!(args[pot + 1], "/work/job-42.pot");
    }

    #[test]
    fn outfile_format_is_pinned_to_hash_and_plain() {
        let args = invocation().to_args();
        assert!(args.iter().any(|a| a == "--outfile-format=1,2"));
        assert_eq!(HashMode::WpaPbkdf2.identifier_fields(), 4);
    }

    #[test]
    fn hash_mode_round_trip_through_selector() {
        assert_eq!(HashMode::from_selector(22001).expect("mode"), HashMode::WpaPmk);
        assert!(HashMode::from_selector(0).is_err());
    }
}
