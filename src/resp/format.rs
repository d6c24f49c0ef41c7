use crate::error::{ChannelError, Result};

/**
 * Builds a command line from a template with `{0}`, `{1}`, ... placeholders.
 *
 * Fails closed: if any argument could break the textual framing of the command
 * the whole call is rejected, so a partially substituted command never exists.
 * This is a guard against corrupting the wire stream, not an escaping scheme.
 */
pub fn format_command<S: AsRef<str>>(template: &str, args: &[S]) -> Result<String> {
    for arg in args {
        validate_argument(arg.as_ref())?;
    }

    let mut command = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        command.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        match placeholder_index(after) {
            Some((index, consumed)) => {
                let arg = args.get(index).ok_or_else(|| {
                    ChannelError::FormatRejected(format!("{{{}}} has no argument", index))
                })?;
                command.push_str(arg.as_ref());
                rest = &after[consumed..];
            },
            None => {
                command.push('{');
                rest = after;
            }
        }
    }
    command.push_str(rest);

    Ok(command)
}

/**
 * Parses `<digits>}` at the start of `text`, returning the index and how many
 * bytes the placeholder body took
 */
fn placeholder_index(text: &str) -> Option<(usize, usize)> {
    let digits = text.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || text.as_bytes().get(digits) != Some(&b'}') {
        return None
    }
    let index = text[..digits].parse::<usize>().ok()?;

    Some((index, digits + 1))
}

fn validate_argument(arg: &str) -> Result<()> {
    let unsafe_char = arg.chars().any(|c| matches!(c, '<' | '>' | '"' | '\'') || c.is_control());

    if arg.is_empty() || unsafe_char || arg.contains("\\N") {
        return Err(ChannelError::FormatRejected(arg.to_owned()))
    }
    Ok(())
}

/**
 * `format_command` over any `Display` arguments:
 * `redis_format!("SET {0} {1}", key, 42)`
 */
#[macro_export]
macro_rules! redis_format {
    ($template:expr $(, $arg:expr)* $(,)?) => {
        $crate::resp::format::format_command(
            $template,
            &[$(::std::string::ToString::to_string(&$arg)),*] as &[::std::string::String]
        )
    };
}
