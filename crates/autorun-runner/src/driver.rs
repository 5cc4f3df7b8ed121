use autorun_core::model::{InteractionRecord, SessionCheck, TurnOutcome};
use autorun_core::{truncate_chars, CancelFlag, HarnessError, HarnessResult};
use tracing::{debug, info, warn};

use crate::client::ServiceClient;

const LOG_PREVIEW_CHARS: usize = 120;

const DEFAULT_SCRIPT: &str = "\
1. What is the effective date of the Pro Referral Network Program?
2. Am I eligible for the referral reward if I'm an AVP?
3. How much reward will I get for referring a Python developer with 5 years of experience?
4. Can I refer my friend who left Bitwise 8 months ago?
5. How do I submit a referral?
6. When will I receive the referral bonus?
7. Can I email the resume to HR instead of using the portal?
8. What happens if someone else already referred the same candidate?
9. Is DevOps considered a niche skill?
10. How much would I get for referring a React JS developer with 10 years experience?
11. Can I track my referral status in real-time?
12. Can I refer someone who applied to Bitwise 4 months ago?
13. What if I resign before the referral bonus is paid?
14. Is there a limit on how many people I can refer?
15. reward for super niche skill
16. What are the Super Niche skills?
17. Who should I contact if I have questions about the referral program?
18. Can third-party contractors get the referral bonus?
19. What's the salary range for a Python developer at Bitwise?
20. How long does the referral ownership last?
";

pub fn default_script() -> Vec<String> {
    parse_script(DEFAULT_SCRIPT)
}

/// One input per non-empty line. A leading `"<digits>. "` enumeration is
/// dropped so the service only sees the question itself.
pub fn parse_script(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| strip_enumeration(line).to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

fn strip_enumeration(line: &str) -> &str {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return line;
    }
    match line[digits..].strip_prefix('.') {
        Some(rest) if rest.starts_with(char::is_whitespace) => rest.trim_start(),
        _ => line,
    }
}

/// Sends every input in order within the already-established session and
/// re-reads the session identity after each turn. A failed turn is recorded
/// and the batch moves on; only an interrupt ends it early.
pub fn run_batch(
    client: &ServiceClient,
    inputs: &[String],
    cancel: &CancelFlag,
) -> HarnessResult<Vec<InteractionRecord>> {
    let total = inputs.len();
    let mut records = Vec::with_capacity(total);
    for (offset, input) in inputs.iter().enumerate() {
        cancel.check("interaction batch")?;
        let index = offset + 1;
        info!(index, total, input = %truncate_chars(input, LOG_PREVIEW_CHARS), "sending turn");
        let outcome = match client.send_turn(input) {
            Ok(output) => {
                info!(index, output = %truncate_chars(&output, LOG_PREVIEW_CHARS), "turn completed");
                TurnOutcome::Completed { output }
            }
            Err(reason) => {
                let err = HarnessError::InteractionFailed {
                    index,
                    reason: reason.clone(),
                };
                warn!(code = err.code(), "{}", err);
                TurnOutcome::Failed { reason }
            }
        };
        let session_after = match client.probe_health() {
            Ok(health) => Some(SessionCheck {
                session_id: health.session_id,
                total_conversations: health.total_conversations,
            }),
            Err(err) => {
                debug!(index, error = %err, "post-turn health probe failed");
                None
            }
        };
        records.push(InteractionRecord {
            index,
            input: input.clone(),
            outcome,
            session_after,
        });
    }
    let failed = records.iter().filter(|r| !r.is_completed()).count();
    info!(total, failed, "interaction batch finished");
    Ok(records)
}
