use super::{Link, Token};
use crate::ConnectionState;
use crate::error::Error;
use crate::hwrng::HwRng;
use crate::platform::{Clock, EntropySource, Serial};
#[cfg(feature = "defmt")]
use defmt::debug;

impl<S: Serial, C: Clock> Link<S, C> {
    /// Elect a master. Both boards run this at power up; the one that pings first becomes
    /// master, a board that never hears back is single. Collisions are retried with a fresh
    /// random backoff. A board attached to a USB host passes `force_master` to skip the backoff
    /// in the first round.
    pub fn determine_state<E: EntropySource>(
        &mut self,
        rng: &mut HwRng<E>,
        force_master: bool,
    ) -> Result<ConnectionState, Error> {
        let mut force_master = force_master;
        for _round in 0..self.config.max_rounds {
            match self.play_round(rng, force_master)? {
                ConnectionState::Collision => {
                    #[cfg(feature = "defmt")]
                    debug!("election collision in round {}", _round);

                    #[cfg(feature = "debug-logs")]
                    println!("  twin: collision in round {_round}");

                    force_master = false;
                }
                state => return Ok(state),
            }
        }
        Err(Error::NegotiationFailed)
    }

    /// A single election round.
    pub fn play_round<E: EntropySource>(
        &mut self,
        rng: &mut HwRng<E>,
        force_master: bool,
    ) -> Result<ConnectionState, Error> {
        self.clock.delay_ms(self.config.settle_ms);

        let backoff = if force_master {
            0
        } else {
            let mut r = [0u8; 1];
            rng.fill_bytes(&mut r)?;
            self.config.backoff_base_ms + (r[0] & self.config.backoff_mask) as u32
        };

        // somebody else may ping first
        if let Some(token) = self.listen(backoff) {
            return Ok(match token {
                Token::Ping => {
                    self.send_token(Token::Ack);
                    ConnectionState::TwinnedSlave
                }
                _ => ConnectionState::Collision,
            });
        }

        self.send_token(Token::Ping);
        let rest = self.config.window_ms.saturating_sub(backoff);
        Ok(match self.listen(rest) {
            Some(Token::Ack) => ConnectionState::TwinnedMaster,
            Some(_) => ConnectionState::Collision,
            None => ConnectionState::Single,
        })
    }

    /// Waits up to `ms` for a ping or an ack. Other bytes are line noise and dropped.
    fn listen(&mut self, ms: u32) -> Option<Token> {
        let start = self.clock.now_ms();
        loop {
            let elapsed = self.clock.now_ms().wrapping_sub(start);
            if elapsed >= ms {
                return None;
            }
            let byte = self.serial.recv_timeout(ms - elapsed)?;
            match Token::from_repr(byte) {
                Some(token @ (Token::Ping | Token::Ack)) => return Some(token),
                _ => continue,
            }
        }
    }
}
