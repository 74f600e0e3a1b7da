//! Topic and payload conventions shared by publishers and subscribers.
//!
//! Data topics are the decimal strings `"0"` .. `"N-1"`. Topic `"0"` doubles
//! as the shutdown channel: a publisher that drains sends the literal payload
//! `exit` there, and the subscriber owning topic `"0"` sees it as an ordinary
//! delivery. Deliveries are decoded once into [`Message`] so the receive loop
//! never compares raw strings.

use rand::Rng;

pub const CONTROL_TOPIC: &str = "0";
pub const READY_TOPIC: &str = "ready";

pub const EXIT_PAYLOAD: &[u8] = b"exit";
pub const READY_PAYLOAD: &[u8] = b"ready";
pub const FILLER_PAYLOAD: &[u8] = b"derp";

/// Length of a latency correlation id in hex characters.
pub const MESSAGE_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    /// Application traffic, carrying a correlation id when the publisher
    /// sampled latency.
    Data {
        id: Option<&'a str>,
        payload: &'a [u8],
    },
    /// A draining publisher's exit sentinel.
    ControlExit,
    /// Publishers finished the readiness handshake.
    Ready,
}

impl<'a> Message<'a> {
    pub fn classify(topic: &str, payload: &'a [u8]) -> Self {
        if topic == READY_TOPIC {
            return Message::Ready;
        }
        if topic == CONTROL_TOPIC && payload == EXIT_PAYLOAD {
            return Message::ControlExit;
        }
        Message::Data {
            id: message_id_of(payload),
            payload,
        }
    }
}

pub fn topic_name(topic: u32) -> String {
    topic.to_string()
}

/// Uniform pick from `[0, topics)`.
pub fn pick_topic<R: Rng>(rng: &mut R, topics: u32) -> u32 {
    rng.random_range(0..topics)
}

pub fn new_message_id<R: Rng>(rng: &mut R) -> String {
    format!("{:0width$x}", rng.random::<u64>(), width = MESSAGE_ID_LEN)
}

fn message_id_of(payload: &[u8]) -> Option<&str> {
    if payload.len() != MESSAGE_ID_LEN {
        return None;
    }
    if !payload
        .iter()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
    {
        return None;
    }
    std::str::from_utf8(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_exit_on_control_topic() {
        assert_eq!(Message::classify("0", b"exit"), Message::ControlExit);
    }

    #[test]
    fn test_exit_on_data_topic_is_data() {
        assert_eq!(
            Message::classify("3", b"exit"),
            Message::Data {
                id: None,
                payload: b"exit"
            }
        );
    }

    #[test]
    fn test_ready_topic() {
        assert_eq!(Message::classify(READY_TOPIC, READY_PAYLOAD), Message::Ready);
        assert_eq!(Message::classify(READY_TOPIC, b"anything"), Message::Ready);
    }

    #[test]
    fn test_data_with_id() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = new_message_id(&mut rng);
        assert_eq!(id.len(), MESSAGE_ID_LEN);

        match Message::classify("0", id.as_bytes()) {
            Message::Data { id: Some(parsed), .. } => assert_eq!(parsed, id),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_filler_has_no_id() {
        assert_eq!(
            Message::classify("1", FILLER_PAYLOAD),
            Message::Data {
                id: None,
                payload: FILLER_PAYLOAD
            }
        );
        assert_eq!(
            Message::classify("1", b"0123456789ABCDEF"),
            Message::Data {
                id: None,
                payload: b"0123456789ABCDEF"
            }
        );
    }

    #[test]
    fn test_topic_selection_is_uniform() {
        const TOPICS: u32 = 8;
        const SAMPLES: usize = 200_000;

        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0usize; TOPICS as usize];
        for _ in 0..SAMPLES {
            counts[pick_topic(&mut rng, TOPICS) as usize] += 1;
        }

        let expected = 1.0 / f64::from(TOPICS);
        for (topic, count) in counts.iter().enumerate() {
            let observed = *count as f64 / SAMPLES as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "topic {topic} frequency {observed} too far from {expected}"
            );
        }
    }
}
