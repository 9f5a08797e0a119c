use rand::rngs::OsRng;
use rand::RngCore;

/// A source of cryptographically secure random bytes.
///
/// Implementations must be usable from any number of concurrent handshakes without external
/// locking. A failing source must return the error instead of falling back to a weaker
/// generator.
pub trait RandomSource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), rand::Error>;
}

/// The operating system CSPRNG. Every call goes straight to the OS, so there is no shared
/// state to synchronize.
#[derive(Copy, Clone, Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    #[inline]
    fn fill(&self, buf: &mut [u8]) -> Result<(), rand::Error> {
        OsRng.try_fill_bytes(buf)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{OsRandom, RandomSource};

    #[test]
    fn test_os_random() {
        let mut a = [0; 1536];
        let mut b = [0; 1536];
        OsRandom.fill(&mut a).unwrap();
        OsRandom.fill(&mut b).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, [0; 1536]);
    }

    #[test]
    fn test_os_random_concurrent() {
        let rng: Arc<dyn RandomSource> = Arc::new(OsRandom);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rng = rng.clone();
                std::thread::spawn(move || {
                    let mut buf = [0; 64];
                    for _ in 0..100 {
                        rng.fill(&mut buf).unwrap();
                    }
                    buf
                })
            })
            .collect();

        let bufs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (i, a) in bufs.iter().enumerate() {
            for b in &bufs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
