// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

use log::warn;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::job::{Job, TaskInfo};
use crate::WorkflowId;

/// Coordination events exchanged between the manager and the scheduler.
///
/// Events are queued on a channel and drained by the engine on the loop
/// thread, so task completions are always applied after the request that
/// was in flight when they arrived.
///
#[derive(Clone, Debug)]
pub enum Event {
    /// Jobs are ready to be translated into queue tasks.
    ScheduleTask {
        workflow: WorkflowId,
        priority: i64,
        jobs: Vec<Job>,
    },

    /// A workflow was cancelled; release its tasks.
    CancelTask { workflow: WorkflowId },

    /// A task finished; deliver its result to the workflow.
    TaskDone {
        workflow: WorkflowId,
        fingerprint: String,
        info: TaskInfo,
    },
}

/// Sending half of the event channel.
#[derive(Clone)]
pub struct Notifier {
    sender: Sender<Event>,
}

impl Notifier {
    /// Queue an event for the engine.
    pub fn notify(&self, event: Event) {
        if self.sender.send(event).is_err() {
            warn!("Dropped an event: the engine receiver is gone.");
        }
    }
}

/// Create a connected notifier and receiver pair.
pub fn channel() -> (Notifier, Receiver<Event>) {
    let (sender, receiver) = mpsc::channel();
    (Notifier { sender }, receiver)
}

#[cfg(test)]
mod tests {
    use serial_test::parallel;

    use super::*;

    #[test]
    #[parallel]
    fn events_arrive_in_order() {
        let (notifier, receiver) = channel();

        notifier.notify(Event::CancelTask { workflow: 1 });
        notifier.notify(Event::CancelTask { workflow: 2 });

        let Ok(Event::CancelTask { workflow }) = receiver.try_recv() else {
            panic!("expected a cancel event");
        };
        assert_eq!(workflow, 1);

        let Ok(Event::CancelTask { workflow }) = receiver.try_recv() else {
            panic!("expected a cancel event");
        };
        assert_eq!(workflow, 2);

        assert!(receiver.try_recv().is_err());
    }

    #[test]
    #[parallel]
    fn notify_survives_a_dropped_receiver() {
        let (notifier, receiver) = channel();
        drop(receiver);

        notifier.notify(Event::CancelTask { workflow: 1 });
    }
}
