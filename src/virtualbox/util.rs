use async_trait::async_trait;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub trait RandomInter: Send + Sync {
    /// A value in `0..n`.
    fn random_int(&self, n: u32) -> u32;
}

pub struct ThreadRandom;

impl RandomInter for ThreadRandom {
    fn random_int(&self, n: u32) -> u32 {
        rand::thread_rng().gen_range(0..n)
    }
}

pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
