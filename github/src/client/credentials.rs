use rand::{seq::SliceRandom, Rng};

#[derive(Debug)]
struct Credential {
    token: String,
    /// Epoch (seconds) at which the token can be used again, if it was rate limited
    rate_limit_reset: Option<i64>,
}

impl Credential {
    fn is_available(&self, now: i64) -> bool {
        match self.rate_limit_reset {
            None => true,
            Some(reset) => reset < now,
        }
    }
}

/// Tracks which API tokens are rate limited and which one is in use.
///
/// The state is local to the process: independent workers sharing the same
/// tokens do not coordinate, the API's answers are what keeps them honest.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    current: usize,
}

impl CredentialPool {
    /// `tokens` must not be empty
    pub fn new<R: Rng>(tokens: Vec<String>, rng: &mut R) -> Self {
        let current = if tokens.is_empty() {
            0
        } else {
            rng.gen_range(0..tokens.len())
        };

        Self {
            credentials: tokens
                .into_iter()
                .map(|token| Credential {
                    token,
                    rate_limit_reset: None,
                })
                .collect(),
            current,
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.credentials.iter().map(|c| c.token.as_str())
    }

    pub fn current_token(&self) -> &str {
        &self.credentials[self.current].token
    }

    pub fn current_available(&self, now: i64) -> bool {
        self.credentials[self.current].is_available(now)
    }

    pub fn any_available(&self, now: i64) -> bool {
        self.credentials.iter().any(|c| c.is_available(now))
    }

    /// Record that `token` is exhausted until `reset`
    pub fn mark_token_rate_limited(&mut self, token: &str, reset: i64) {
        if let Some(credential) = self.credentials.iter_mut().find(|c| c.token == token) {
            credential.rate_limit_reset = Some(reset);
        }
    }

    /// Switch to a token chosen uniformly at random among the available ones,
    /// preferring any token other than the current one. Picking at random
    /// keeps workers sharing a token set from all jumping on the same token.
    ///
    /// Returns false, leaving the pool untouched, when no token is available.
    pub fn rotate<R: Rng>(&mut self, now: i64, rng: &mut R) -> bool {
        let available: Vec<usize> = (0..self.credentials.len())
            .filter(|&i| self.credentials[i].is_available(now))
            .collect();
        let others: Vec<usize> = available
            .iter()
            .copied()
            .filter(|&i| i != self.current)
            .collect();

        let candidates = if others.is_empty() { &available } else { &others };
        match candidates.choose(rng) {
            Some(&next) => {
                self.current = next;
                true
            }
            None => false,
        }
    }

    /// Earliest moment at which a rate limited token becomes available again
    pub fn next_reset(&self) -> Option<i64> {
        self.credentials
            .iter()
            .filter_map(|c| c.rate_limit_reset)
            .min()
    }
}

#[cfg(test)]
mod test {
    use super::CredentialPool;
    use rand::{rngs::StdRng, SeedableRng};

    fn pool(tokens: &[&str]) -> (CredentialPool, StdRng) {
        let mut rng = StdRng::seed_from_u64(7);
        let pool = CredentialPool::new(tokens.iter().map(|t| t.to_string()).collect(), &mut rng);
        (pool, rng)
    }

    #[test]
    fn rotate_prefers_another_token() {
        let (mut pool, mut rng) = pool(&["a", "b", "c"]);
        for _ in 0..20 {
            let before = pool.current_token().to_owned();
            assert!(pool.rotate(100, &mut rng));
            assert_ne!(pool.current_token(), before);
        }
    }

    #[test]
    fn rate_limited_tokens_are_skipped_until_reset() {
        let (mut pool, mut rng) = pool(&["a", "b"]);
        let limited = pool.current_token().to_owned();
        pool.mark_token_rate_limited(&limited, 1_000);

        assert!(!pool.current_available(999));
        assert!(pool.rotate(999, &mut rng));
        assert_ne!(pool.current_token(), limited);

        let other = pool.current_token().to_owned();
        pool.mark_token_rate_limited(&other, 2_000);
        assert!(!pool.any_available(999));
        assert!(!pool.rotate(999, &mut rng));
        assert_eq!(pool.next_reset(), Some(1_000));

        // Reset time passed: the first token is a candidate again
        assert!(pool.any_available(1_001));
        assert!(pool.rotate(1_001, &mut rng));
        assert_eq!(pool.current_token(), limited);
    }

    #[test]
    fn single_token_rotates_onto_itself() {
        let (mut pool, mut rng) = pool(&["only"]);
        assert!(pool.rotate(0, &mut rng));
        assert_eq!(pool.current_token(), "only");
    }
}
