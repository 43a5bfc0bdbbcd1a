//! Assistant REPL run in the second PTY child
//!
//! The multiplexer core only ever sees the assistant as bytes on a PTY
//! master. The REPL itself sits behind the [`Agent`] trait so the remote
//! backend stays swappable and tests can inject a scripted double. The
//! stock binary wires [`StaticAgent`], a stand-in that works offline; the
//! networked agent, bookmark store, and session tracking of the full
//! assistant live outside this crate.

use std::io::{self, BufRead, Write};

use anyhow::Result;

/// Backend answering assistant queries.
pub trait Agent {
    fn ask(&mut self, prompt: &str) -> Result<String>;
}

/// Offline placeholder backend.
pub struct StaticAgent;

impl Agent for StaticAgent {
    fn ask(&mut self, prompt: &str) -> Result<String> {
        Ok(format!("no agent backend is configured (asked: {prompt})"))
    }
}

/// Line-oriented REPL: prompt, read, forward to the agent, print the reply.
/// `exit` or EOF ends the loop.
pub struct BasicRepl<A: Agent> {
    agent: A,
}

impl<A: Agent> BasicRepl<A> {
    pub fn new(agent: A) -> Self {
        BasicRepl { agent }
    }

    /// Run against process stdio; the exit code becomes the child's.
    pub fn run(&mut self) -> i32 {
        let stdin = io::stdin();
        let stdout = io::stdout();
        match self.run_with(stdin.lock(), stdout.lock()) {
            Ok(code) => code,
            Err(_) => 1,
        }
    }

    pub fn run_with<R: BufRead, W: Write>(&mut self, mut input: R, mut out: W) -> io::Result<i32> {
        loop {
            write!(out, "? ")?;
            out.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim();
            if line == "exit" {
                break;
            }
            if line.is_empty() {
                continue;
            }

            match self.agent.ask(line) {
                Ok(reply) => writeln!(out, "{reply}")?,
                Err(err) => writeln!(out, "error: {err:#}")?,
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Test double returning scripted replies.
    struct ScriptedAgent {
        replies: VecDeque<&'static str>,
        asked: Vec<String>,
    }

    impl Agent for ScriptedAgent {
        fn ask(&mut self, prompt: &str) -> Result<String> {
            self.asked.push(prompt.to_string());
            Ok(self.replies.pop_front().unwrap_or("out of script").to_string())
        }
    }

    #[test]
    fn test_repl_forwards_lines_and_prints_replies() {
        let agent = ScriptedAgent {
            replies: VecDeque::from(["first", "second"]),
            asked: Vec::new(),
        };
        let mut repl = BasicRepl::new(agent);

        let input = b"hello\n\nworld\nexit\n";
        let mut out = Vec::new();
        let code = repl.run_with(&input[..], &mut out).unwrap();

        assert_eq!(code, 0);
        assert_eq!(repl.agent.asked, vec!["hello", "world"]);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn test_repl_stops_on_eof() {
        let agent = ScriptedAgent {
            replies: VecDeque::new(),
            asked: Vec::new(),
        };
        let mut repl = BasicRepl::new(agent);
        let mut out = Vec::new();
        let code = repl.run_with(&b"ask me\n"[..], &mut out).unwrap();
        assert_eq!(code, 0);
        assert_eq!(repl.agent.asked, vec!["ask me"]);
    }

    #[test]
    fn test_static_agent_mentions_prompt() {
        let mut agent = StaticAgent;
        let reply = agent.ask("what now").unwrap();
        assert!(reply.contains("what now"));
    }
}
