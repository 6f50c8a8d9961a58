//! Interactive shutdown confirmation.

use std::io::{self, BufRead, Write};

pub const QUIT_PROMPT: &str = "Do you really want to quit? [y/n] ";

/// Ask whether to quit. Answers starting with `y`/`Y` confirm; anything else
/// declines. End of input confirms, since nobody is left to answer.
pub fn confirm_shutdown<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> io::Result<bool> {
    output.write_all(QUIT_PROMPT.as_bytes())?;
    output.flush()?;

    let mut answer = String::new();
    if input.read_line(&mut answer)? == 0 {
        return Ok(true);
    }
    Ok(matches!(answer.trim_start().chars().next(), Some('y' | 'Y')))
}
