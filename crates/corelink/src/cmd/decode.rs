use std::io::Read;

use crate::cmd::DecodeArgs;
use crate::exit::{msg_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = match args.payload {
        Some(payload) => payload,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| CliError::new(INTERNAL, format!("reading stdin: {e}")))?;
            buf
        }
    };
    let message =
        corelink_msg::decode_message(payload.as_bytes()).map_err(|e| msg_error("decode", e))?;

    match format {
        OutputFormat::Json => {
            let out = serde_json::to_string(&message)
                .map_err(|e| CliError::new(INTERNAL, format!("encoding output: {e}")))?;
            println!("{out}");
        }
        OutputFormat::Pretty => {
            let out = serde_json::to_string_pretty(&message)
                .map_err(|e| CliError::new(INTERNAL, format!("encoding output: {e}")))?;
            println!("{} {}", message.kind(), out);
        }
    }
    Ok(SUCCESS)
}
