//! Terminal device prompt

use async_trait::async_trait;
use common::DeviceInfo;
use mirror::DeviceChooser;
use std::io::{self, BufRead, Write};
use tracing::{debug, warn};

/// Asks on stdin which device to mirror
///
/// A single candidate is taken without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalChooser;

#[async_trait]
impl DeviceChooser for TerminalChooser {
    async fn choose(&self, candidates: &[DeviceInfo]) -> Option<usize> {
        match candidates.len() {
            0 => None,
            1 => Some(0),
            count => {
                let listing: Vec<String> = candidates.iter().map(|d| d.to_string()).collect();
                let answer = tokio::task::spawn_blocking(move || ask(&listing)).await;
                match answer {
                    Ok(Ok(line)) => parse_choice(&line, count),
                    Ok(Err(e)) => {
                        warn!("Failed to read device choice: {}", e);
                        None
                    }
                    Err(e) => {
                        warn!("Device prompt task failed: {}", e);
                        None
                    }
                }
            }
        }
    }
}

fn ask(listing: &[String]) -> io::Result<String> {
    let mut stderr = io::stderr().lock();
    writeln!(stderr, "Several devices are attached:")?;
    for (i, entry) in listing.iter().enumerate() {
        writeln!(stderr, "  {}) {}", i + 1, entry)?;
    }
    write!(stderr, "Mirror which device? [1-{}, empty to cancel]: ", listing.len())?;
    stderr.flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

/// Map a 1-based answer to a candidate index
pub fn parse_choice(answer: &str, count: usize) -> Option<usize> {
    let answer = answer.trim();
    if answer.is_empty() {
        debug!("Device choice cancelled");
        return None;
    }
    match answer.parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Some(n - 1),
        _ => {
            warn!("Ignoring device choice {:?}", answer);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("1\n", 3), Some(0));
        assert_eq!(parse_choice(" 3 ", 3), Some(2));
        assert_eq!(parse_choice("4", 3), None);
        assert_eq!(parse_choice("0", 3), None);
        assert_eq!(parse_choice("\n", 3), None);
        assert_eq!(parse_choice("pixel", 3), None);
    }

    #[tokio::test]
    async fn test_single_candidate_is_taken() {
        let device = mirror::test_utils::create_mock_device_info();
        assert_eq!(TerminalChooser.choose(&[device]).await, Some(0));
        assert_eq!(TerminalChooser.choose(&[]).await, None);
    }
}
