//! The worker runtime: a fixed pool of workers draining one shared inbound
//! channel, with per-group FIFO queues guaranteeing at-most-one concurrent
//! execution per serialization group.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::Message;
use crate::request::{self, RequestKind};
use crate::service::Service;

/// A unit of per-group work.
pub(crate) type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

tokio::task_local! {
    /// The serialization group the current task executes under.
    static CURRENT_GROUP: String;
}

/// Whether the calling task already holds the given group.
pub(crate) fn executing_group(group: &str) -> bool {
    CURRENT_GROUP.try_with(|g| g == group).unwrap_or(false)
}

/// Run a task holding its group, so nested scheduling onto the same group
/// can be detected.
async fn scoped(group: String, task: Task) {
    CURRENT_GROUP.scope(group, task).await;
}

/// Per-group FIFO queues. Presence of a map entry marks the group as
/// in-flight; the backlog holds tasks waiting for the owner to drain them.
#[derive(Default)]
pub(crate) struct GroupQueues {
    queues: Mutex<HashMap<String, VecDeque<Task>>>,
}

impl GroupQueues {
    pub(crate) fn new() -> Arc<GroupQueues> {
        Arc::new(GroupQueues::default())
    }

    /// Claim the group for `task`, or append it to the backlog of the
    /// current owner. Returns the task back when the caller became the
    /// owner and must [`drain`](GroupQueues::drain).
    fn submit(&self, group: &str, task: Task) -> Option<Task> {
        let mut queues = self.queues.lock().unwrap();
        match queues.get_mut(group) {
            Some(backlog) => {
                backlog.push_back(task);
                None
            }
            None => {
                queues.insert(group.to_string(), VecDeque::new());
                Some(task)
            }
        }
    }

    /// Run the claimed task and whatever lands in the group's backlog
    /// meanwhile, releasing the group when it runs dry.
    async fn drain(&self, group: String, first: Task) {
        let mut current = first;
        loop {
            scoped(group.clone(), current).await;
            let next = {
                let mut queues = self.queues.lock().unwrap();
                let backlog = queues
                    .get_mut(&group)
                    .expect("in-flight group vanished from the queue map");
                match backlog.pop_front() {
                    Some(task) => Some(task),
                    None => {
                        queues.remove(&group);
                        None
                    }
                }
            };
            match next {
                Some(task) => current = task,
                None => return,
            }
        }
    }

    /// Run `task` under `group`: execute it (and any backlog) when the
    /// group is idle, otherwise leave it for the current owner and return
    /// immediately.
    pub(crate) async fn run(&self, group: String, task: Task) {
        if let Some(task) = self.submit(&group, task) {
            self.drain(group, task).await;
        }
    }

    /// Number of groups currently in flight. Test instrumentation.
    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

/// Work staged from one inbound message.
enum Staged {
    /// The worker claimed the task's group and must drain it.
    Own { group: String, task: Task },
    /// A parallel handler, executed inline without a group claim.
    Parallel(Task),
    /// Appended to a busy group's backlog, or dropped during resolution;
    /// nothing left for this worker to do.
    Done,
}

/// Spawn the worker pool over a shared inbound receiver.
pub(crate) fn spawn_workers(
    service: Service,
    rx: mpsc::Receiver<Message>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..count)
        .map(|_| tokio::spawn(worker_loop(service.clone(), rx.clone())))
        .collect()
}

async fn worker_loop(service: Service, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>) {
    loop {
        // Resolve and claim while holding the receiver, so group claims
        // follow channel order exactly; execution happens after release.
        let staged = {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(msg) => stage(&service, msg),
                None => break,
            }
        };
        match staged {
            Staged::Own { group, task } => service.queues().drain(group, task).await,
            Staged::Parallel(task) => task.await,
            Staged::Done => {}
        }
    }
}

/// Resolve one inbound message to a handler task and claim its group.
fn stage(service: &Service, msg: Message) -> Staged {
    let Some(parsed) = request::parse_subject(&msg.subject) else {
        debug!(subject = %msg.subject, "unrecognized subject dropped");
        return Staged::Done;
    };
    let Some(m) = service.lookup(&parsed.rid) else {
        // Covered by a subscription but no handler matches. Access requests
        // may be answered by another service; everything else gets notFound.
        if parsed.kind != RequestKind::Access && !msg.reply.is_empty() {
            crate::service::reply_not_found(service, &msg.reply);
        }
        return Staged::Done;
    };
    let parallel = m.handler.parallel;
    let group = m.group.clone();
    let task: Task = Box::pin(request::execute(service.clone(), parsed, m, msg));
    if parallel {
        return Staged::Parallel(task);
    }
    match service.queues().submit(&group, task) {
        Some(task) => Staged::Own { group, task },
        None => Staged::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_task(
        counter: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<usize>>>,
        id: usize,
    ) -> Task {
        Box::pin(async move {
            let active = counter.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            counter.fetch_sub(1, Ordering::SeqCst);
            order.lock().unwrap().push(id);
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_group_is_serialized_in_order() {
        let queues = GroupQueues::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..5 {
            let q = queues.clone();
            let task = counting_task(active.clone(), max_seen.clone(), order.clone(), id);
            // Claim synchronously in submission order, as the workers do.
            match q.submit("group.a", task) {
                Some(first) => handles.push(tokio::spawn(async move {
                    q.drain("group.a".to_string(), first).await;
                })),
                None => {}
            }
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(&*order.lock().unwrap(), &[0, 1, 2, 3, 4]);
        assert_eq!(queues.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_groups_run_concurrently() {
        let queues = GroupQueues::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..4 {
            let q = queues.clone();
            let task = counting_task(active.clone(), max_seen.clone(), order.clone(), id);
            handles.push(tokio::spawn(async move {
                q.run(format!("group.{id}"), task).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) > 1);
        assert_eq!(queues.in_flight(), 0);
    }

    #[tokio::test]
    async fn group_tag_is_visible_inside_task() {
        let queues = GroupQueues::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        queues
            .run(
                "tag.group".to_string(),
                Box::pin(async move {
                    *seen_in.lock().unwrap() = Some(executing_group("tag.group"));
                }),
            )
            .await;
        assert_eq!(*seen.lock().unwrap(), Some(true));
        assert!(!executing_group("tag.group"));
    }
}
