use std::io::{self, BufRead, Write};

/// Interactive shell. Deliberately thin: there is no line-at-a-time
/// compilation path in the core, so the prompt only knows how to quit.
pub fn repl() {
    println!("Entering REPL mode...");
    let stdin = io::stdin();
    let mut input = stdin.lock();

    loop {
        print!(">>> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        if line.trim() == "exit" {
            break;
        }
        println!("Unknown Command");
        println!("Command List:");
        println!("  exit");
    }
}
