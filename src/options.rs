use std::fmt;
use std::time::Duration;

use crate::blocks::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::tftp::TftpOption;

/// Block size used when nothing else was negotiated.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Advertised to the server, never acted upon.
pub const DEFAULT_RETRY_COUNT: u32 = 6;

/// The option names understood by both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionCode {
    BlockSize,
    FileSize,
    Timeout,
    BlockCount,
    FileMd5,
    Retry,
}

impl OptionCode {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionCode::BlockSize => "blksize",
            OptionCode::FileSize => "tsize",
            OptionCode::Timeout => "timeout",
            OptionCode::BlockCount => "blkcnt",
            OptionCode::FileMd5 => "tmd5",
            OptionCode::Retry => "retry",
        }
    }

    pub fn from_name(name: &str) -> Option<OptionCode> {
        match name.to_lowercase().as_str() {
            "blksize" => Some(OptionCode::BlockSize),
            "tsize" => Some(OptionCode::FileSize),
            "timeout" => Some(OptionCode::Timeout),
            "blkcnt" => Some(OptionCode::BlockCount),
            "tmd5" => Some(OptionCode::FileMd5),
            "retry" => Some(OptionCode::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for OptionCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The transfer configuration a receiver derives from the options of a write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub block_size: usize,
    /// Number of DATA packets to expect. Without it the transfer ends at the first short block.
    pub block_count: Option<u32>,
    pub file_size: Option<u64>,
    /// Whole-file digest the written file is checked against once the transfer ends.
    pub md5: Option<String>,
    pub timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: None,
            file_size: None,
            md5: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TransferOptions {
    /// Interprets a request's options on top of the defaults.
    ///
    /// Each recognized option replaces its default when its value is well formed. Malformed
    /// values and unknown names are logged and skipped; `retry` is accepted and ignored.
    pub fn from_options(options: &[TftpOption], default_timeout: Duration) -> TransferOptions {
        let mut result = TransferOptions {
            timeout: default_timeout,
            ..TransferOptions::default()
        };

        for option in options {
            let name = option.name().original();
            let value = option.value().original().trim();

            let Some(code) = OptionCode::from_name(name) else {
                log::warn!("Ignoring unknown option '{}'", option);
                continue;
            };

            let accepted = match code {
                OptionCode::BlockSize => match value.parse::<usize>() {
                    Ok(n) if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&n) => {
                        result.block_size = n;
                        true
                    }
                    _ => false,
                },
                OptionCode::BlockCount => match value.parse::<u32>() {
                    Ok(n) => {
                        result.block_count = Some(n);
                        true
                    }
                    Err(_) => false,
                },
                OptionCode::FileSize => match value.parse::<u64>() {
                    Ok(n) => {
                        result.file_size = Some(n);
                        true
                    }
                    Err(_) => false,
                },
                OptionCode::FileMd5 if !value.is_empty() => {
                    result.md5 = Some(value.to_lowercase());
                    true
                }
                OptionCode::FileMd5 => false,
                OptionCode::Timeout => match value.parse::<u64>() {
                    Ok(secs) if secs > 0 => {
                        result.timeout = Duration::from_secs(secs);
                        true
                    }
                    _ => false,
                },
                OptionCode::Retry => true,
            };

            if !accepted {
                log::warn!("Ignoring malformed option '{}'", option);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_names() {
        for code in [
            OptionCode::BlockSize,
            OptionCode::FileSize,
            OptionCode::Timeout,
            OptionCode::BlockCount,
            OptionCode::FileMd5,
            OptionCode::Retry,
        ] {
            assert_eq!(OptionCode::from_name(code.as_str()), Some(code));
        }
        assert_eq!(OptionCode::from_name("BLKSIZE"), Some(OptionCode::BlockSize));
        assert_eq!(OptionCode::from_name("windowsize"), None);
    }

    #[test]
    fn test_defaults_without_options() {
        let options = TransferOptions::from_options(&[], Duration::from_secs(3));
        assert_eq!(options.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(options.block_count, None);
        assert_eq!(options.file_size, None);
        assert_eq!(options.md5, None);
        assert_eq!(options.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_all_options_applied() {
        let options = vec![
            TftpOption::from_code(OptionCode::BlockCount, "2"),
            TftpOption::from_code(OptionCode::BlockSize, "8192"),
            TftpOption::from_code(OptionCode::FileSize, "10000"),
            TftpOption::from_code(OptionCode::FileMd5, "0CC175B9C0F1B6A831C399E269772661"),
            TftpOption::from_code(OptionCode::Retry, "6"),
            TftpOption::from_code(OptionCode::Timeout, "4"),
        ];

        let parsed = TransferOptions::from_options(&options, DEFAULT_TIMEOUT);
        assert_eq!(
            parsed,
            TransferOptions {
                block_size: 8192,
                block_count: Some(2),
                file_size: Some(10000),
                md5: Some("0cc175b9c0f1b6a831c399e269772661".to_string()),
                timeout: Duration::from_secs(4),
            }
        );
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let options = vec![
            TftpOption::new("blksize", "0"),
            TftpOption::new("blksize", "65465"),
            TftpOption::new("blkcnt", "many"),
            TftpOption::new("tsize", "-1"),
            TftpOption::new("timeout", "0"),
            TftpOption::new("tmd5", ""),
            TftpOption::new("windowsize", "4"),
        ];

        assert_eq!(TransferOptions::from_options(&options, DEFAULT_TIMEOUT), TransferOptions::default());
    }

    #[test]
    fn test_block_size_bounds() {
        let min = TransferOptions::from_options(&[TftpOption::new("blksize", "1")], DEFAULT_TIMEOUT);
        assert_eq!(min.block_size, 1);
        let max = TransferOptions::from_options(&[TftpOption::new("blksize", "65464")], DEFAULT_TIMEOUT);
        assert_eq!(max.block_size, 65464);
    }
}
