// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming Re-emitters (C5): both dialects share a token-accounting step
//! and differ only in SSE framing, implemented in [`openai`] and
//! [`anthropic`] respectively.

pub mod accounting;
pub mod anthropic;
pub mod openai;

/// Why the model stopped producing output, independent of dialect framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

impl FinishReason {
    pub fn from_tool_calls_present(has_tool_calls: bool) -> Self {
        if has_tool_calls {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        }
    }
}

/// The first-token-retry loop's outcome (spec §4.5): a distinct result
/// variant rather than an exception, so callers can decide how to frame the
/// timeout in either dialect without unwinding through an error path meant
/// for genuine upstream failures.
#[derive(Debug)]
pub enum FirstByteOutcome<T> {
    Delivered(T),
    TimedOut,
}

/// Drives a fallible, retryable async operation until either it produces a
/// value or the retry budget is exhausted, honoring the rule that retries
/// only happen before a single byte has reached the client: `attempt` itself
/// is responsible for not re-entering once it has begun emitting.
pub async fn retry_until_first_byte<F, Fut, T, E>(
    max_retries: u32,
    mut attempt: F,
) -> Result<FirstByteOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>, E>>,
{
    for _ in 0..=max_retries {
        match attempt().await? {
            Some(value) => return Ok(FirstByteOutcome::Delivered(value)),
            None => continue,
        }
    }
    Ok(FirstByteOutcome::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_loop_returns_delivered_on_first_success() {
        let result: Result<FirstByteOutcome<u32>, ()> =
            retry_until_first_byte(3, || async { Ok(Some(42)) }).await;
        assert!(matches!(result, Ok(FirstByteOutcome::Delivered(42))));
    }

    #[tokio::test]
    async fn retry_loop_times_out_after_exhausting_budget() {
        let mut calls = 0;
        let result: Result<FirstByteOutcome<u32>, ()> = retry_until_first_byte(2, || {
            calls += 1;
            async { Ok(None) }
        })
        .await;
        assert!(matches!(result, Ok(FirstByteOutcome::TimedOut)));
        assert_eq!(calls, 3);
    }
}
