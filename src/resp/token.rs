use crate::error::{ChannelError, Result};

// Protocol-level limits on what a single reply may announce
pub const MAX_BULK_LENGTH: usize = 512 * 1024 * 1024;
pub const MAX_ARRAY_SIZE: usize = 1024 * 1024;

/**
 * One reply header line, classified by its first character
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RESPToken {
    SimpleString(String),       // "+<STRING>\r\n"
    Error(String),              // "-<STRING>\r\n"
    Integer(String),            // ":<INT>\r\n"
    BulkHeader(usize),          // "$<SIZE>\r\n" (payload follows)
    Null,                       // "$-1\r\n"
    NullArray,                  // "*-1\r\n"
    ArraySize(usize)            // "*<SIZE>\r\n"
}

impl RESPToken {
    /**
     * Classifies a line with its terminator already stripped.
     * The empty line counts as a payload-less status.
     */
    pub fn from_line(line: &str) -> Result<RESPToken> {
        let malformed = || ChannelError::Protocol(line.to_owned());

        let mut chars = line.chars();
        let prefix = match chars.next() {
            Some(prefix) => prefix,
            None => return Ok(RESPToken::SimpleString(String::new())),
        };
        let rest = chars.as_str();

        match prefix {
            '+' => Ok(RESPToken::SimpleString(rest.to_owned())),
            '-' => Ok(RESPToken::Error(rest.to_owned())),
            ':' => {
                let digits = rest.strip_prefix('-').unwrap_or(rest);
                if is_decimal(digits) {
                    Ok(RESPToken::Integer(rest.to_owned()))
                } else {
                    Err(malformed())
                }
            },
            '$' => match rest {
                "-1" => Ok(RESPToken::Null),
                _ => {
                    let size = parse_size(rest).ok_or_else(malformed)?;
                    if size > MAX_BULK_LENGTH {
                        return Err(ChannelError::Protocol(
                            format!("bulk length {} exceeds limit: {}", size, line)
                        ));
                    }
                    Ok(RESPToken::BulkHeader(size))
                }
            },
            '*' => match rest {
                "-1" => Ok(RESPToken::NullArray),
                _ => {
                    let size = parse_size(rest).ok_or_else(malformed)?;
                    if size > MAX_ARRAY_SIZE {
                        return Err(ChannelError::Protocol(
                            format!("array size {} exceeds limit: {}", size, line)
                        ));
                    }
                    Ok(RESPToken::ArraySize(size))
                }
            },
            _ => Err(malformed()),
        }
    }

    pub fn to_string(self) -> String {
        match self {
            RESPToken::SimpleString(s) => format!("+{}\r\n", s),
            RESPToken::Error(s) => format!("-{}\r\n", s),
            RESPToken::Integer(n) => format!(":{}\r\n", n),
            RESPToken::BulkHeader(size) => format!("${}\r\n", size),
            RESPToken::Null => "$-1\r\n".to_owned(),
            RESPToken::NullArray => "*-1\r\n".to_owned(),
            RESPToken::ArraySize(size) => format!("*{}\r\n", size),
        }
    }
}

fn is_decimal(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

fn parse_size(text: &str) -> Option<usize> {
    if !is_decimal(text) {
        return None
    }
    text.parse::<usize>().ok()
}
