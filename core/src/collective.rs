//! Collective communication between cooperating ranks.
//!
//! Estimation may be spread over several ranks. Only the coordinator (rank 0) holds input data,
//! draws random numbers and writes output; the other ranks exist to share the work of the
//! optimizer. Every collective operation must be called by every rank, in the same order and the
//! same number of times, and the caller on the coordinator provides the payload.
//!
//! [`Solo`] is the trivial single-rank communicator. [`LocalGroup`] connects ranks running on
//! separate threads of the same process through channels, with the coordinator as the hub.

use std::{fmt, num::NonZeroUsize, sync::Arc};

use crossbeam::channel::{self, Receiver, Sender};

use crate::optimize::Problem;

/// Rank of the coordinating participant.
pub const COORDINATOR: usize = 0;

/// Collective operations shared by all participants of an estimation run.
pub trait Communicator: Send + Sync {
    /// Returns the rank of this participant.
    fn rank(&self) -> usize;

    /// Returns the number of participants.
    fn size(&self) -> usize;

    /// Returns `true` if this participant is the coordinator.
    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }

    /// Sends a count from the coordinator to every participant.
    ///
    /// The coordinator must provide `Some` value, which is returned to every participant.
    fn broadcast_count(&self, value: Option<usize>) -> Result<usize, CollectiveError>;

    /// Sends an optimization problem from the coordinator to every participant.
    fn broadcast_problem(
        &self,
        problem: Option<Arc<Problem>>,
    ) -> Result<Arc<Problem>, CollectiveError>;

    /// Replaces `values` with the element-wise sum of `values` over all participants.
    ///
    /// Partial sums are combined in rank order.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), CollectiveError>;

    /// Signals every other participant to stop.
    ///
    /// Participants blocked in, or later entering, a collective call return
    /// [`CollectiveError::Aborted`].
    fn abort(&self);
}

/// A communicator for a single participant.
#[derive(Clone, Copy, Debug, Default)]
pub struct Solo;

impl Communicator for Solo {
    fn rank(&self) -> usize {
        COORDINATOR
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast_count(&self, value: Option<usize>) -> Result<usize, CollectiveError> {
        value.ok_or(CollectiveError::MissingPayload)
    }

    fn broadcast_problem(
        &self,
        problem: Option<Arc<Problem>>,
    ) -> Result<Arc<Problem>, CollectiveError> {
        problem.ok_or(CollectiveError::MissingPayload)
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<(), CollectiveError> {
        Ok(())
    }

    fn abort(&self) {}
}

enum Message {
    Count(usize),
    Problem(Arc<Problem>),
    Sums(Vec<f64>),
    Abort,
}

impl Message {
    fn name(&self) -> &'static str {
        match self {
            Message::Count(_) => "count",
            Message::Problem(_) => "problem",
            Message::Sums(_) => "sums",
            Message::Abort => "abort",
        }
    }
}

/// Constructor for a group of participants connected by in-process channels.
#[derive(Debug)]
pub struct LocalGroup;

impl LocalGroup {
    /// Creates `size` connected participants, ordered by rank.
    ///
    /// Each participant is meant to be moved to its own thread.
    pub fn new(size: NonZeroUsize) -> Vec<Member> {
        let size = size.get();

        let (to_spokes, from_hub): (Vec<_>, Vec<_>) =
            (1..size).map(|_| channel::unbounded()).unzip();
        let (to_hub, from_spokes): (Vec<_>, Vec<_>) =
            (1..size).map(|_| channel::unbounded()).unzip();

        let hub = Member {
            rank: COORDINATOR,
            size,
            links: Links::Hub {
                to_spokes,
                from_spokes,
            },
        };

        let spokes = from_hub
            .into_iter()
            .zip(to_hub)
            .enumerate()
            .map(|(i, (from_hub, to_hub))| Member {
                rank: i + 1,
                size,
                links: Links::Spoke { to_hub, from_hub },
            });

        std::iter::once(hub).chain(spokes).collect()
    }
}

/// A single participant of a [`LocalGroup`].
pub struct Member {
    rank: usize,
    size: usize,
    links: Links,
}

enum Links {
    Hub {
        to_spokes: Vec<Sender<Message>>,
        from_spokes: Vec<Receiver<Message>>,
    },
    Spoke {
        to_hub: Sender<Message>,
        from_hub: Receiver<Message>,
    },
}

impl Member {
    fn send_to_spokes<F>(&self, mut message: F) -> Result<(), CollectiveError>
    where
        F: FnMut() -> Message,
    {
        if let Links::Hub { to_spokes, .. } = &self.links {
            for (i, sender) in to_spokes.iter().enumerate() {
                sender
                    .send(message())
                    .map_err(|_| CollectiveError::Disconnected { rank: i + 1 })?;
            }
        }

        Ok(())
    }

    fn receive_from_hub(&self) -> Result<Message, CollectiveError> {
        match &self.links {
            Links::Spoke { from_hub, .. } => match from_hub.recv() {
                Ok(Message::Abort) => Err(CollectiveError::Aborted),
                Ok(message) => Ok(message),
                Err(_) => Err(CollectiveError::Disconnected { rank: COORDINATOR }),
            },
            Links::Hub { .. } => Err(CollectiveError::Protocol {
                expected: "spoke",
                found: "hub",
            }),
        }
    }
}

impl Communicator for Member {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_count(&self, value: Option<usize>) -> Result<usize, CollectiveError> {
        if self.is_coordinator() {
            let value = value.ok_or(CollectiveError::MissingPayload)?;
            self.send_to_spokes(|| Message::Count(value))?;
            Ok(value)
        } else {
            match self.receive_from_hub()? {
                Message::Count(value) => Ok(value),
                other => Err(CollectiveError::Protocol {
                    expected: "count",
                    found: other.name(),
                }),
            }
        }
    }

    fn broadcast_problem(
        &self,
        problem: Option<Arc<Problem>>,
    ) -> Result<Arc<Problem>, CollectiveError> {
        if self.is_coordinator() {
            let problem = problem.ok_or(CollectiveError::MissingPayload)?;
            self.send_to_spokes(|| Message::Problem(Arc::clone(&problem)))?;
            Ok(problem)
        } else {
            match self.receive_from_hub()? {
                Message::Problem(problem) => Ok(problem),
                other => Err(CollectiveError::Protocol {
                    expected: "problem",
                    found: other.name(),
                }),
            }
        }
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), CollectiveError> {
        match &self.links {
            Links::Hub { from_spokes, .. } => {
                for (i, receiver) in from_spokes.iter().enumerate() {
                    let rank = i + 1;
                    match receiver.recv() {
                        Ok(Message::Sums(partial)) if partial.len() == values.len() => values
                            .iter_mut()
                            .zip(partial)
                            .for_each(|(total, x)| *total += x),
                        Ok(Message::Abort) => {
                            self.abort();
                            return Err(CollectiveError::Aborted);
                        }
                        Ok(other) => {
                            return Err(CollectiveError::Protocol {
                                expected: "sums",
                                found: other.name(),
                            })
                        }
                        Err(_) => return Err(CollectiveError::Disconnected { rank }),
                    }
                }

                let totals = values.to_vec();
                self.send_to_spokes(|| Message::Sums(totals.clone()))
            }
            Links::Spoke { to_hub, .. } => {
                to_hub
                    .send(Message::Sums(values.to_vec()))
                    .map_err(|_| CollectiveError::Disconnected { rank: COORDINATOR })?;

                match self.receive_from_hub()? {
                    Message::Sums(totals) if totals.len() == values.len() => {
                        values.copy_from_slice(&totals);
                        Ok(())
                    }
                    other => Err(CollectiveError::Protocol {
                        expected: "sums",
                        found: other.name(),
                    }),
                }
            }
        }
    }

    fn abort(&self) {
        log::debug!("Rank {} signalling abort", self.rank);

        match &self.links {
            Links::Hub { to_spokes, .. } => to_spokes.iter().for_each(|sender| {
                let _ = sender.send(Message::Abort);
            }),
            Links::Spoke { to_hub, .. } => {
                let _ = to_hub.send(Message::Abort);
            }
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

/// An error associated with a collective operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CollectiveError {
    /// Another participant signalled an abort.
    Aborted,
    /// A participant hung up before completing a collective call.
    Disconnected {
        /// Rank of the participant that hung up.
        rank: usize,
    },
    /// The coordinator called a broadcast without a payload.
    MissingPayload,
    /// Participants called collective operations out of order.
    Protocol {
        /// The expected message.
        expected: &'static str,
        /// The received message.
        found: &'static str,
    },
}

impl fmt::Display for CollectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveError::Aborted => f.write_str("run aborted by another rank"),
            CollectiveError::Disconnected { rank } => {
                write!(f, "rank {rank} disconnected during a collective call")
            }
            CollectiveError::MissingPayload => {
                f.write_str("coordinator provided no payload to broadcast")
            }
            CollectiveError::Protocol { expected, found } => write!(
                f,
                "collective protocol violation: expected {expected} message, found {found}"
            ),
        }
    }
}

impl std::error::Error for CollectiveError {}
