//! Cloudflare R2 object storage adapter.
//!
//! Every request issued through the adapter first takes a token from the
//! bucket limiter, which serialises all R2 traffic for the process.

use crate::config::R2Config;
use crate::error::R2Error;
use crate::shutdown::Shutdown;
use aws_config::BehaviorVersion;
use aws_config::Region;
use aws_sdk_s3::config::{Credentials, RequestChecksumCalculation, ResponseChecksumValidation};
use aws_sdk_s3::primitives::ByteStream;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// One request per this interval. Confirm with the operator before changing.
pub(crate) const REQUEST_INTERVAL: Duration = Duration::from_secs(2);
const BURST: u32 = 1;

/// Token bucket over the tokio clock.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    interval: Duration,
    burst: u32,
}

struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(interval: Duration, burst: u32) -> TokenBucket {
        TokenBucket {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            interval,
            burst,
        }
    }

    /// Suspend until a token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed();
                if elapsed >= self.interval {
                    let refills = (elapsed.as_nanos() / self.interval.as_nanos()) as u32;
                    state.tokens = state.tokens.saturating_add(refills).min(self.burst);
                    state.last_refill += self.interval * refills;
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.interval.saturating_sub(state.last_refill.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// S3-compatible client bound to one R2 account.
pub struct R2 {
    pub account_id: String,
    client: aws_sdk_s3::Client,
    limiter: TokenBucket,
    shutdown: Shutdown,
}

impl R2 {
    /// Build the client for `https://<accountId>.eu.r2.cloudflarestorage.com`
    /// with static credentials. Checksum calculation and validation are
    /// relaxed to when-required, which R2 needs.
    pub async fn connect(config: &R2Config) -> R2 {
        let endpoint = format!("https://{}.eu.r2.cloudflarestorage.com", config.account_id);
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.access_key_secret,
            None,
            None,
            "draken",
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new("auto"))
            .endpoint_url(&endpoint)
            .credentials_provider(credentials)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&sdk_config);

        debug!("r2 configuration loaded for endpoint {endpoint}");
        R2 {
            account_id: config.account_id.clone(),
            client,
            limiter: TokenBucket::new(REQUEST_INTERVAL, BURST),
            shutdown: Shutdown::new(),
        }
    }

    /// Take a limiter token. Use before any call through [`client`](Self::client).
    pub async fn acquire(&self) {
        self.limiter.acquire().await;
    }

    /// The raw S3 client. Callers must `acquire` a token per request.
    pub fn client(&self) -> &aws_sdk_s3::Client {
        &self.client
    }

    pub async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), R2Error> {
        self.acquire().await;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)?;
        Ok(())
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, R2Error> {
        self.acquire().await;
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)?;
        let data = output.body.collect().await?;
        Ok(data.into_bytes().to_vec())
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), R2Error> {
        self.acquire().await;
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)?;
        Ok(())
    }

    /// Cancel the adapter context. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.trigger();
    }

    /// The adapter's cancellable context; `stop` triggers it.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_spaces_requests_by_the_interval() {
        let bucket = TokenBucket::new(REQUEST_INTERVAL, 1);
        let start = Instant::now();

        bucket.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        bucket.acquire().await;
        assert!(start.elapsed() >= REQUEST_INTERVAL);

        bucket.acquire().await;
        assert!(start.elapsed() >= REQUEST_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_allows_back_to_back_tokens() {
        let bucket = TokenBucket::new(Duration::from_secs(1), 2);
        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_does_not_stockpile_tokens() {
        let bucket = TokenBucket::new(Duration::from_secs(1), 1);
        tokio::time::advance(Duration::from_secs(30)).await;

        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        // Only one token despite the long idle stretch.
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
