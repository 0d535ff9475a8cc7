//! Response framing
//!
//! Responses follow the TS 27.007 verbose format: every response starts on a new
//! line, and when information lines precede the final result code, the result code
//! is separated from them by an empty line.

use tracing::warn;

/// Line break used in every response
pub const CRLF: &str = "\r\n";

/// Locally generated success result
pub const OK_RESPONSE: &str = "\r\nOK\r\n";

/// Locally generated failure result
pub const ERROR_RESPONSE: &str = "\r\nERROR\r\n";

/// Final result codes, in the order they are searched for
const FINAL_RESULTS: [&str; 4] = ["OK\r\n", "ERROR\r\n", "+CME ERROR:", "+CMS ERROR:"];

/// Prefix of the line reporting the end of a data mode session
pub const DATAMODE_NOTIFICATION: &str = "#XDATAMODE";

/// Frame an engine response for transmission
///
/// Prepends the leading CRLF and inserts a CRLF before the last final result code
/// when information lines come before it. A response without a recognizable final
/// result is passed through with only the leading CRLF added.
pub fn format_final_result(response: &str) -> String {
    let mut out = String::with_capacity(response.len() + 2 * CRLF.len());
    out.push_str(CRLF);
    out.push_str(response);

    let Some(pos) = FINAL_RESULTS.iter().find_map(|code| out.rfind(code)) else {
        warn!("Final result not found");
        return out;
    };

    if pos != CRLF.len() {
        out.insert_str(pos, CRLF);
    }
    out
}

/// Line sent when a data mode session ends
pub fn datamode_exit_line(result: i32) -> String {
    format!("\r\n{DATAMODE_NOTIFICATION}: {result}\r\n")
}
