// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod abi;
pub mod bridge_api;
pub mod config;
pub mod error;
pub mod event_source;
pub mod explorer;
pub mod metrics;
pub mod node;
pub mod policy;
pub mod prover;
pub mod scheduler;
pub mod steps;
pub mod storage;
pub mod transactor;
pub mod tx_executor;
pub mod types;

#[cfg(test)]
pub mod test_utils;

/// Retries `$func` with exponential backoff until it succeeds or `$max_elapsed_time` passes.
/// Evaluates to `Result<Result<T, E>, E>`: the outer error is the last failure once the
/// budget is spent.
#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // Delays (secs, with jitter): 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 51.2, 60, 60 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(60),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => Ok(result),
                    Err(e) => {
                        tracing::debug!("Retrying due to error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
