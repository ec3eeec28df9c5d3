//! Hierarchical subject router.
//!
//! The router holds handlers keyed by dot-delimited patterns and resolves a
//! concrete subject to the most specific matching handler, its captured path
//! parameters, and its serialization group. Specificity is literal over
//! placeholder over full wildcard, compared segment by segment from the
//! root; between two wildcard candidates the deeper one wins.
//!
//! A `Router` is a cloneable handle to shared state, so a sub-router can be
//! mounted into a parent while the caller keeps registering handlers on its
//! own clone; lookups resolve against the live trie.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::event::{EventInfo, ListenerFn};
use crate::handler::Handler;
use crate::pattern::{self, GroupTemplate, Pattern, Segment};
use crate::service::{Service, ServiceInner};

/// A registered handler entry.
pub(crate) struct RegEntry {
    pub(crate) handler: Arc<Handler>,
    pub(crate) pattern: Pattern,
    pub(crate) group: Option<GroupTemplate>,
    announced: AtomicBool,
}

/// The result of resolving a subject.
pub(crate) struct Match {
    pub(crate) handler: Arc<Handler>,
    pub(crate) params: HashMap<String, String>,
    pub(crate) group: String,
    pub(crate) listeners: Vec<ListenerFn>,
}

#[derive(Default)]
struct Node {
    entry: Option<Arc<RegEntry>>,
    listeners: Vec<ListenerFn>,
    literals: HashMap<String, Node>,
    param: Option<Box<Node>>,
    /// Terminal `>` child; never has children of its own.
    wild: Option<Box<Node>>,
    mount: Option<Router>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.entry.is_none()
            && self.listeners.is_empty()
            && self.literals.is_empty()
            && self.param.is_none()
            && self.wild.is_none()
            && self.mount.is_none()
    }
}

#[derive(Clone)]
struct Attachment {
    service: Weak<ServiceInner>,
    /// Absolute pattern of this router's root, mount prefixes included.
    prefix: String,
}

struct RouterInner {
    pattern: String,
    mounted: bool,
    attach: Option<Attachment>,
    root: Node,
}

/// Deferred on-register notification, fired outside the trie locks.
type PendingRegister = (Service, String, Arc<Handler>, crate::handler::OnRegisterFn);

/// A pattern-keyed handler router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Mutex<RouterInner>>,
}

impl Router {
    /// Create a router with its own pattern prefix. An empty pattern creates
    /// a root-less router that must be mounted under a non-empty prefix.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is non-empty and not a valid dotted name.
    pub fn new(pattern: &str) -> Router {
        if !pattern.is_empty() && !pattern::valid_dotted(pattern) {
            panic!("invalid router pattern {:?}", pattern);
        }
        Router {
            inner: Arc::new(Mutex::new(RouterInner {
                pattern: pattern.to_string(),
                mounted: false,
                attach: None,
                root: Node::default(),
            })),
        }
    }

    /// The router's own pattern prefix.
    pub fn pattern(&self) -> String {
        self.inner.lock().unwrap().pattern.clone()
    }

    /// Register a handler for a pattern relative to this router.
    ///
    /// The empty pattern registers the router's own prefix as a resource,
    /// addressable with no extra tokens.
    ///
    /// # Panics
    ///
    /// Panics on an invalid pattern, an invalid group template, or a pattern
    /// that already has a handler.
    pub fn handle(&self, pat: &str, handler: Handler) {
        let parsed = match Pattern::parse(pat) {
            Ok(p) => p,
            Err(msg) => panic!("{}", msg),
        };
        let group = handler.group.as_ref().map(|tpl| {
            match GroupTemplate::parse(tpl, &parsed) {
                Ok(g) => g,
                Err(msg) => panic!("{}", msg),
            }
        });
        let entry = Arc::new(RegEntry {
            handler: Arc::new(handler),
            pattern: parsed,
            group,
            announced: AtomicBool::new(false),
        });

        let pending = {
            let mut inner = self.inner.lock().unwrap();
            let node = descend(&mut inner.root, entry.pattern.segments(), pat);
            if node.mount.is_some() {
                panic!("pattern {:?} collides with a mounted router", pat);
            }
            if node.entry.is_some() {
                panic!("pattern {:?} already has a handler", pat);
            }
            node.entry = Some(entry.clone());
            inner
                .attach
                .clone()
                .and_then(|attach| fire_for_entry(&attach, &entry))
        };
        if let Some((service, abs, handler, hook)) = pending {
            hook(service, abs, handler);
        }
    }

    /// Attach an event listener to a pattern. Listeners are invoked, in
    /// registration order, for every event emitted on a resource that the
    /// pattern's handler entry matched.
    pub fn add_listener<F>(&self, pat: &str, f: F)
    where
        F: Fn(&EventInfo) + Send + Sync + 'static,
    {
        let parsed = match Pattern::parse(pat) {
            Ok(p) => p,
            Err(msg) => panic!("{}", msg),
        };
        let mut inner = self.inner.lock().unwrap();
        let node = descend(&mut inner.root, parsed.segments(), pat);
        if node.mount.is_some() {
            panic!("listener pattern {:?} collides with a mounted router", pat);
        }
        node.listeners.push(Arc::new(f));
    }

    /// Mount a sub-router under a prefix.
    ///
    /// The sub-router's own pattern, if any, is appended to the prefix.
    /// Handlers registered on the sub-router after mounting remain
    /// reachable through this router.
    ///
    /// # Panics
    ///
    /// Panics if the sub-router is already mounted, if both prefix and
    /// sub-pattern are empty, or if the mount point is already in use.
    pub fn mount(&self, prefix: &str, sub: Router) {
        if !prefix.is_empty() && !pattern::valid_dotted(prefix) {
            panic!("invalid mount prefix {:?}", prefix);
        }
        if Arc::ptr_eq(&self.inner, &sub.inner) {
            panic!("cannot mount a router into itself");
        }

        let pending = {
            let mut inner = self.inner.lock().unwrap();
            let mut sub_inner = sub.inner.lock().unwrap();
            if sub_inner.mounted {
                panic!("router is already mounted");
            }
            let path = join_pattern(prefix, &sub_inner.pattern);
            if path.is_empty() {
                panic!("cannot mount a root-less router to an empty prefix");
            }
            let segments: Vec<Segment> = path
                .split('.')
                .map(|t| Segment::Literal(t.to_string()))
                .collect();
            let node = descend(&mut inner.root, &segments, &path);
            if !node.is_empty() {
                panic!("mount point {:?} is already in use", path);
            }
            sub_inner.mounted = true;
            node.mount = Some(sub.clone());

            match inner.attach.clone() {
                Some(attach) => {
                    let prefix = join_pattern(&attach.prefix, &path);
                    attach_locked(&mut sub_inner, attach.service.clone(), prefix)
                }
                None => Vec::new(),
            }
        };
        for (service, abs, handler, hook) in pending {
            hook(service, abs, handler);
        }
    }

    /// Create a sub-router with the given pattern, pass it to `f` for
    /// registration, mount it, and return it.
    pub fn route<F: FnOnce(&Router)>(&self, pat: &str, f: F) -> Router {
        let sub = Router::new(pat);
        f(&sub);
        self.mount("", sub.clone());
        sub
    }

    /// Attach this router tree to a service under an absolute prefix,
    /// firing pending on-register hooks.
    pub(crate) fn attach(&self, service: Weak<ServiceInner>, prefix: String) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            if inner.attach.is_some() {
                panic!("router is already attached to a service");
            }
            attach_locked(&mut inner, service, prefix)
        };
        for (service, abs, handler, hook) in pending {
            hook(service, abs, handler);
        }
    }

    /// Resolve a full subject (this router's own pattern included) to a
    /// handler match.
    pub(crate) fn lookup(&self, subject: &str) -> Option<Match> {
        let tokens: Vec<&str> = subject.split('.').collect();
        let found = {
            let inner = self.inner.lock().unwrap();
            let skip = consume_own_pattern(&inner.pattern, &tokens)?;
            search(&inner.root, &tokens, skip, skip)?
        };
        let remaining = tokens[found.base..].join(".");
        let (params, _rest) = found.entry.pattern.matches(&remaining)?;
        let group = match &found.entry.group {
            Some(tpl) => tpl.expand(&params),
            None => subject.to_string(),
        };
        Some(Match {
            handler: found.entry.handler.clone(),
            params,
            group,
            listeners: found.listeners,
        })
    }

    /// Whether any registered handler, mounts included, satisfies the
    /// predicate.
    pub(crate) fn contains(&self, pred: &dyn Fn(&Handler) -> bool) -> bool {
        let inner = self.inner.lock().unwrap();
        node_contains(&inner.root, pred)
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::new("")
    }
}

/// Join two dotted patterns, either of which may be empty.
fn join_pattern(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{}.{}", a, b),
    }
}

/// Number of leading tokens consumed by the router's own pattern, or `None`
/// if the subject does not start with it.
fn consume_own_pattern(pattern: &str, tokens: &[&str]) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }
    let own: Vec<&str> = pattern.split('.').collect();
    if tokens.len() < own.len() || tokens[..own.len()] != own[..] {
        return None;
    }
    Some(own.len())
}

/// Walk or create the node path for a pattern's segments.
fn descend<'a>(root: &'a mut Node, segments: &[Segment], pat: &str) -> &'a mut Node {
    let mut node = root;
    for segment in segments {
        if node.mount.is_some() {
            panic!("pattern {:?} descends into a mounted router", pat);
        }
        node = match segment {
            Segment::Literal(lit) => node.literals.entry(lit.clone()).or_default(),
            Segment::Param(_) => {
                if node.param.is_none() {
                    node.param = Some(Box::default());
                }
                node.param.as_deref_mut().unwrap()
            }
            Segment::FullWildcard => {
                if node.wild.is_none() {
                    node.wild = Some(Box::default());
                }
                node.wild.as_deref_mut().unwrap()
            }
        };
    }
    node
}

struct Found {
    entry: Arc<RegEntry>,
    listeners: Vec<ListenerFn>,
    /// Token index where the owning router's subtree began.
    base: usize,
}

fn search(node: &Node, tokens: &[&str], i: usize, base: usize) -> Option<Found> {
    if let Some(mounted) = &node.mount {
        let sub = mounted.inner.lock().unwrap();
        return search(&sub.root, tokens, i, i);
    }
    if i == tokens.len() {
        return node.entry.as_ref().map(|entry| Found {
            entry: entry.clone(),
            listeners: node.listeners.clone(),
            base,
        });
    }
    if tokens[i].is_empty() {
        return None;
    }
    if let Some(child) = node.literals.get(tokens[i]) {
        if let Some(found) = search(child, tokens, i + 1, base) {
            return Some(found);
        }
    }
    if let Some(child) = &node.param {
        if let Some(found) = search(child, tokens, i + 1, base) {
            return Some(found);
        }
    }
    if let Some(wild) = &node.wild {
        return wild.entry.as_ref().map(|entry| Found {
            entry: entry.clone(),
            listeners: wild.listeners.clone(),
            base,
        });
    }
    None
}

fn node_contains(node: &Node, pred: &dyn Fn(&Handler) -> bool) -> bool {
    if let Some(entry) = &node.entry {
        if pred(&entry.handler) {
            return true;
        }
    }
    if let Some(mounted) = &node.mount {
        if mounted.contains(pred) {
            return true;
        }
    }
    node.literals.values().any(|n| node_contains(n, pred))
        || node
            .param
            .as_deref()
            .is_some_and(|n| node_contains(n, pred))
        || node.wild.as_deref().is_some_and(|n| node_contains(n, pred))
}

/// Mark a router attached and collect on-register notifications for every
/// entry in its tree, cascading into mounted sub-routers.
fn attach_locked(
    inner: &mut RouterInner,
    service: Weak<ServiceInner>,
    prefix: String,
) -> Vec<PendingRegister> {
    inner.attach = Some(Attachment {
        service: service.clone(),
        prefix: prefix.clone(),
    });
    let mut pending = Vec::new();
    collect_attach(&inner.root, &service, &prefix, String::new(), &mut pending);
    pending
}

fn collect_attach(
    node: &Node,
    service: &Weak<ServiceInner>,
    prefix: &str,
    path: String,
    pending: &mut Vec<PendingRegister>,
) {
    if let Some(entry) = &node.entry {
        let attach = Attachment {
            service: service.clone(),
            prefix: prefix.to_string(),
        };
        if let Some(fire) = fire_for_entry(&attach, entry) {
            pending.push(fire);
        }
    }
    if let Some(mounted) = &node.mount {
        // The mount path is the literal node path, which equals the prefix
        // recorded when the mount node was created; recompute it from the
        // sub-router's perspective at cascade time.
        let mut sub = mounted.inner.lock().unwrap();
        if sub.attach.is_none() {
            let sub_prefix = join_pattern(prefix, &path);
            let mut nested = attach_locked(&mut sub, service.clone(), sub_prefix);
            pending.append(&mut nested);
        }
    }
    for (token, child) in &node.literals {
        let child_path = join_pattern(&path, token);
        collect_attach(child, service, prefix, child_path, pending);
    }
    if let Some(child) = &node.param {
        collect_attach(child, service, prefix, path.clone(), pending);
    }
    if let Some(child) = &node.wild {
        collect_attach(child, service, prefix, path, pending);
    }
}

fn fire_for_entry(attach: &Attachment, entry: &Arc<RegEntry>) -> Option<PendingRegister> {
    let hook = entry.handler.on_register.clone()?;
    if entry.announced.swap(true, Ordering::SeqCst) {
        return None;
    }
    let service = Service::from_weak(&attach.service)?;
    let abs = join_pattern(&attach.prefix, entry.pattern.raw());
    Some((service, abs, entry.handler.clone(), hook))
}
