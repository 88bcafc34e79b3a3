//! Console output of `rced im` commands

use rce_instance::TextOutputReceiver;

/// Prints every line to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleOutputReceiver;

impl TextOutputReceiver for ConsoleOutputReceiver {
    fn add_output(&self, line: &str) {
        println!("{}", line);
    }
}
