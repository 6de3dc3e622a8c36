//! Sliding window sequencer.
//!
//! Each issued command is stamped with the next sequence number and parked in
//! the slot of that number until its reply arrives.  The target answers
//! strictly in order, so a reply for sequence `s` proves the commands from
//! the oldest outstanding slot up to `s` were lost.  Those are moved to the
//! reissue queue straight away rather than waiting for a timeout.
//!
//! If no reply arrives for the configured timeout, every outstanding command
//! is reissued.  After the configured number of consecutive timeouts the
//! link is declared dead.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::collections::VecDeque;
use core::time::Duration;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::engine::LinkConfig;
use crate::packet::{Packet, PacketSink, SEQUENCE_SPACE};
use crate::queue::Command;

/// A command the sequencer had no room for.  Returned to the caller
/// untouched.
#[derive(Debug)]
pub struct Refused(pub Command);

/// Outcome of a timeout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCheck {
    /// Still within the timeout, or nothing outstanding
    Waiting,
    /// Timed out; all outstanding commands queued for reissue
    Retrying,
    /// Timed out too many times in a row
    Exhausted,
}

enum Slot {
    Empty,
    Issued(Command),
}

impl Slot {
    fn is_issued(&self) -> bool {
        matches!(self, Slot::Issued(_))
    }

    fn take(&mut self) -> Option<Command> {
        match core::mem::replace(self, Slot::Empty) {
            Slot::Issued(command) => Some(command),
            Slot::Empty => None,
        }
    }
}

fn next(seq: u8) -> u8 {
    (seq + 1) % SEQUENCE_SPACE as u8
}

/// Slot table, sequence counters and reissue queue for one link.
pub struct Sequencer {
    slots: [Slot; SEQUENCE_SPACE],
    tx_seq: u8,
    rx_seq: u8,
    in_flight: usize,
    reissue: VecDeque<Command>,
    window: usize,
    timeout: Duration,
    retries: u32,
    timer_start: Duration,
    timeouts: u32,
}

impl Sequencer {
    /// Create an idle sequencer using the window, timeout and retry limit
    /// from `config`.
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::Empty),
            tx_seq: 0,
            rx_seq: 0,
            in_flight: 0,
            reissue: VecDeque::new(),
            window: config.window.clamp(1, SEQUENCE_SPACE),
            timeout: config.timeout,
            retries: config.retries.max(1),
            timer_start: Duration::ZERO,
            timeouts: 0,
        }
    }

    /// Sequence number the next command will get.
    pub fn tx_seq(&self) -> u8 {
        self.tx_seq
    }

    /// Sequence number of the next expected reply.
    pub fn rx_seq(&self) -> u8 {
        self.rx_seq
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn reissue_pending(&self) -> usize {
        self.reissue.len()
    }

    /// Whether a command is waiting for its reply in slot `seq`.
    pub fn is_outstanding(&self, seq: u8) -> bool {
        self.slots[seq as usize % SEQUENCE_SPACE].is_issued()
    }

    /// Nothing in flight and nothing waiting for reissue.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.reissue.is_empty()
    }

    pub fn can_issue(&self) -> bool {
        self.in_flight < self.window && !self.slots[self.tx_seq as usize].is_issued()
    }

    /// Stamp `command` with the next sequence number and transmit it.
    pub fn issue<S: PacketSink>(
        &mut self,
        mut command: Command,
        sink: &mut S,
    ) -> Result<u8, Refused> {
        if !self.can_issue() {
            return Err(Refused(command));
        }

        let seq = self.tx_seq;
        command.packet.set_sequence(seq);
        trace!("Issuing {:?} as sequence {seq}", command.packet.opcode());
        sink.transmit(&command.packet);

        self.slots[seq as usize] = Slot::Issued(command);
        self.in_flight += 1;
        self.tx_seq = next(seq);
        Ok(seq)
    }

    /// Issue queued reissues while the window has room.  Returns the number
    /// transmitted.
    pub fn reissue<S: PacketSink>(&mut self, sink: &mut S) -> usize {
        let mut count = 0;
        while let Some(command) = self.reissue.pop_front() {
            match self.issue(command, sink) {
                Ok(_) => count += 1,
                Err(Refused(command)) => {
                    self.reissue.push_front(command);
                    break;
                }
            }
        }
        count
    }

    /// Handle a reply.  Returns false if nothing was waiting on its sequence
    /// number, in which case the reply is ignored.
    pub fn on_receive(&mut self, rx: &Packet) -> bool {
        let seq = rx.sequence();
        if !self.slots[seq as usize].is_issued() {
            debug!("Ignoring reply for sequence {seq}, nothing outstanding");
            return false;
        }

        self.requeue_until(seq);
        self.rx_seq = next(seq);
        if let Some(command) = self.slots[seq as usize].take() {
            self.in_flight -= 1;
            trace!("Sequence {seq} acknowledged");
            command.acked(rx);
        }
        true
    }

    /// Check for a reply timeout.  `progressed` is whether any reply was
    /// accepted since the last check.
    pub fn check_timeout(&mut self, now: Duration, progressed: bool) -> TimeoutCheck {
        if progressed || self.is_idle() {
            self.timer_start = now;
            self.timeouts = 0;
            return TimeoutCheck::Waiting;
        }

        if now.saturating_sub(self.timer_start) < self.timeout {
            return TimeoutCheck::Waiting;
        }

        self.timeouts += 1;
        self.timer_start = now;
        if self.timeouts >= self.retries {
            error!(
                "No reply after {} attempts, {} commands outstanding",
                self.timeouts, self.in_flight
            );
            return TimeoutCheck::Exhausted;
        }

        warn!(
            "Reply timeout ({}/{}), reissuing {} commands",
            self.timeouts, self.retries, self.in_flight
        );
        self.requeue_all();
        TimeoutCheck::Retrying
    }

    /// Fail every outstanding and reissue-pending command: the reissue queue
    /// first, then in-flight slots oldest first.
    pub fn abort_all(&mut self) {
        while let Some(command) = self.reissue.pop_front() {
            command.abort();
        }
        let mut seq = self.rx_seq;
        for _ in 0..SEQUENCE_SPACE {
            if let Some(command) = self.slots[seq as usize].take() {
                command.abort();
            }
            seq = next(seq);
        }
        self.in_flight = 0;
        self.rx_seq = self.tx_seq;
        self.timeouts = 0;
    }

    // Move every in-flight command, oldest first, to the reissue queue.
    fn requeue_all(&mut self) {
        let mut seq = self.rx_seq;
        for _ in 0..SEQUENCE_SPACE {
            if let Some(command) = self.slots[seq as usize].take() {
                self.reissue.push_back(command);
            }
            seq = next(seq);
        }
        self.in_flight = 0;
        self.rx_seq = self.tx_seq;
    }

    // Replies for the slots between rx_seq and seq were lost.
    fn requeue_until(&mut self, seq: u8) {
        while self.rx_seq != seq {
            if let Some(command) = self.slots[self.rx_seq as usize].take() {
                debug!("Reply for sequence {} lost, reissuing", self.rx_seq);
                self.in_flight -= 1;
                self.reissue.push_back(command);
            }
            self.rx_seq = next(self.rx_seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Opcode;
    use crate::queue::Completion;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Sent(Vec<Packet>);

    impl PacketSink for Sent {
        fn transmit(&mut self, packet: &Packet) {
            self.0.push(packet.clone());
        }
    }

    fn command(tag: u8) -> Command {
        Command::new(Packet::new(Opcode::BulkRead, &[0, 0, 0, tag, 0]).unwrap())
    }

    fn reply(seq: u8) -> Packet {
        let mut packet = Packet::new(Opcode::BulkRead, &[]).unwrap();
        packet.set_sequence(seq);
        packet
    }

    fn config(window: usize) -> LinkConfig {
        LinkConfig {
            window,
            ..Default::default()
        }
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut seq = Sequencer::new(&config(4));
        let mut sent = Sent::default();
        for ii in 0..40u8 {
            assert_eq!(seq.issue(command(ii), &mut sent).unwrap(), ii % 16);
            assert!(seq.on_receive(&reply(ii % 16)));
            assert!(seq.is_idle());
        }
        let seqs: Vec<u8> = sent.0.iter().map(|p| p.sequence()).collect();
        assert_eq!(seqs[15], 15);
        assert_eq!(seqs[16], 0);
        assert_eq!(seq.tx_seq(), 40 % 16);
        assert_eq!(seq.rx_seq(), 40 % 16);
    }

    #[test]
    fn window_refuses_and_returns_command() {
        let mut seq = Sequencer::new(&config(4));
        let mut sent = Sent::default();
        for ii in 0..4 {
            seq.issue(command(ii), &mut sent).unwrap();
        }
        assert!(!seq.can_issue());
        let Err(Refused(refused)) = seq.issue(command(4), &mut sent) else {
            panic!("window overrun");
        };
        assert_eq!(refused.packet.data()[3], 4);
        assert_eq!(sent.0.len(), 4);
        assert_eq!(seq.in_flight(), 4);
    }

    #[test]
    fn full_window_of_sixteen() {
        let mut seq = Sequencer::new(&config(64));
        let mut sent = Sent::default();
        for ii in 0..16 {
            seq.issue(command(ii), &mut sent).unwrap();
        }
        assert!(!seq.can_issue());
        assert_eq!(seq.tx_seq(), seq.rx_seq());

        // Reply to the newest: all fifteen before it were lost
        assert!(seq.on_receive(&reply(15)));
        assert_eq!(seq.reissue_pending(), 15);
        assert_eq!(seq.in_flight(), 0);
        assert_eq!(seq.reissue(&mut sent), 15);
        let tags: Vec<u8> = sent.0[16..].iter().map(|p| p.data()[3]).collect();
        assert_eq!(tags, (0..15).collect::<Vec<u8>>());
    }

    #[test]
    fn gap_triggers_reissue() {
        let mut seq = Sequencer::new(&config(4));
        let mut sent = Sent::default();
        let acked = Rc::new(RefCell::new(Vec::new()));
        for ii in 0..4u8 {
            let acked = acked.clone();
            let cmd = Command::with_callback(
                Packet::new(Opcode::BulkRead, &[0, 0, 0, ii, 0]).unwrap(),
                move |c| {
                    if let Completion::Acked { tx, .. } = c {
                        acked.borrow_mut().push(tx.data()[3]);
                    }
                },
            );
            seq.issue(cmd, &mut sent).unwrap();
        }

        assert!(seq.on_receive(&reply(2)));
        assert_eq!(*acked.borrow(), vec![2]);
        assert!(!seq.is_outstanding(0));
        assert!(!seq.is_outstanding(1));
        assert!(!seq.is_outstanding(2));
        assert!(seq.is_outstanding(3));
        assert_eq!(seq.rx_seq(), 3);
        assert_eq!(seq.in_flight(), 1);
        assert_eq!(seq.reissue_pending(), 2);

        // Reissued oldest first, with fresh sequence numbers
        assert_eq!(seq.reissue(&mut sent), 2);
        assert_eq!(sent.0[4].data()[3], 0);
        assert_eq!(sent.0[4].sequence(), 4);
        assert_eq!(sent.0[5].data()[3], 1);
        assert_eq!(sent.0[5].sequence(), 5);

        for s in [3, 4, 5] {
            assert!(seq.on_receive(&reply(s)));
        }
        assert_eq!(*acked.borrow(), vec![2, 3, 0, 1]);
        assert!(seq.is_idle());
    }

    #[test]
    fn stale_reply_ignored() {
        let mut seq = Sequencer::new(&config(4));
        let mut sent = Sent::default();
        seq.issue(command(0), &mut sent).unwrap();
        assert!(seq.on_receive(&reply(0)));

        // Duplicate, and a reply for something never sent
        assert!(!seq.on_receive(&reply(0)));
        assert!(!seq.on_receive(&reply(9)));
        assert_eq!(seq.rx_seq(), 1);
        assert!(seq.is_idle());
    }

    #[test]
    fn timeout_requeues_then_gives_up() {
        let mut seq = Sequencer::new(&config(4));
        let mut sent = Sent::default();
        let ms = Duration::from_millis;

        assert_eq!(seq.check_timeout(ms(0), false), TimeoutCheck::Waiting);
        seq.issue(command(0), &mut sent).unwrap();
        seq.issue(command(1), &mut sent).unwrap();

        assert_eq!(seq.check_timeout(ms(49), false), TimeoutCheck::Waiting);
        assert_eq!(seq.check_timeout(ms(50), false), TimeoutCheck::Retrying);
        assert_eq!(seq.reissue_pending(), 2);
        assert_eq!(seq.in_flight(), 0);
        assert_eq!(seq.reissue(&mut sent), 2);

        // Timer restarted by the retry
        assert_eq!(seq.check_timeout(ms(60), false), TimeoutCheck::Waiting);
        assert_eq!(seq.check_timeout(ms(100), false), TimeoutCheck::Retrying);
        seq.reissue(&mut sent);
        assert_eq!(seq.check_timeout(ms(150), false), TimeoutCheck::Exhausted);
    }

    #[test]
    fn progress_resets_timeouts() {
        let mut seq = Sequencer::new(&config(4));
        let mut sent = Sent::default();
        let ms = Duration::from_millis;

        seq.issue(command(0), &mut sent).unwrap();
        seq.issue(command(1), &mut sent).unwrap();
        assert_eq!(seq.check_timeout(ms(50), false), TimeoutCheck::Retrying);
        seq.reissue(&mut sent);
        assert_eq!(seq.check_timeout(ms(100), false), TimeoutCheck::Retrying);
        seq.reissue(&mut sent);

        // Sequences 4 and 5 now carry the commands; ack the first
        assert!(seq.on_receive(&reply(4)));
        assert_eq!(seq.check_timeout(ms(120), true), TimeoutCheck::Waiting);
        assert_eq!(seq.check_timeout(ms(170), false), TimeoutCheck::Retrying);
    }

    #[test]
    fn abort_fails_reissue_queue_then_slots() {
        let mut seq = Sequencer::new(&config(4));
        let mut sent = Sent::default();
        let order = Rc::new(RefCell::new(Vec::new()));
        for ii in 0..4u8 {
            let order = order.clone();
            let cmd = Command::with_callback(
                Packet::new(Opcode::BulkRead, &[0, 0, 0, ii, 0]).unwrap(),
                move |c| {
                    assert!(!c.is_success());
                    order.borrow_mut().push(ii);
                },
            );
            seq.issue(cmd, &mut sent).unwrap();
        }
        // 0 and 1 lost, waiting for reissue; 2 and 3 still in flight
        seq.requeue_until(2);
        seq.abort_all();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
        assert!(seq.is_idle());
        assert_eq!(seq.rx_seq(), seq.tx_seq());
    }
}
