//! Fixed-depth prefix tree clustering of masked failure reasons.
//!
//! Reasons are split on whitespace. The tree is keyed first by token count,
//! then by the leading tokens; each leaf holds the clusters whose templates
//! are compared token by token against a new reason. Positions where a
//! matched reason differs from its template become `<*>`.

use std::collections::{BTreeSet, HashMap};

/// Placeholder for a template position that varies between reasons.
pub const WILDCARD: &str = "<*>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: u64,
    pub tokens: Vec<String>,
    pub size: u64,
}

impl Cluster {
    pub fn template(&self) -> String {
        self.tokens.join(" ")
    }
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    clusters: Vec<u64>,
}

/// Outcome of adding one reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    TemplateChanged,
    Unchanged,
}

#[derive(Debug)]
pub struct Drain {
    similarity: f64,
    prefix_depth: usize,
    max_children: usize,
    roots: HashMap<usize, Node>,
    clusters: HashMap<u64, Cluster>,
    last_id: u64,
    dirty: BTreeSet<u64>,
}

impl Drain {
    /// `depth` counts the length layer and the leaf, so 4 keys leaves on
    /// the first token.
    pub fn new(similarity: f64, depth: usize, max_children: usize) -> Self {
        Self {
            similarity,
            prefix_depth: depth.saturating_sub(3),
            max_children: max_children.max(2),
            roots: HashMap::new(),
            clusters: HashMap::new(),
            last_id: 0,
            dirty: BTreeSet::new(),
        }
    }

    /// Put back a stored cluster. Must be called in id order.
    pub fn restore(&mut self, cluster: Cluster) {
        self.last_id = self.last_id.max(cluster.id);
        self.insert(cluster.id, &cluster.tokens);
        self.clusters.insert(cluster.id, cluster);
    }

    /// Assign `masked` to a cluster, creating one when nothing is similar
    /// enough.
    pub fn add(&mut self, masked: &str) -> (&Cluster, Change) {
        let tokens: Vec<String> = masked.split_whitespace().map(str::to_string).collect();

        let (id, change) = match self.search(&tokens).and_then(|id| self.clusters.get_mut(&id)) {
            Some(cluster) => {
                let merged = merge(&cluster.tokens, &tokens);
                let change = if merged == cluster.tokens {
                    Change::Unchanged
                } else {
                    cluster.tokens = merged;
                    Change::TemplateChanged
                };
                cluster.size += 1;
                (cluster.id, change)
            }
            None => {
                self.last_id += 1;
                let id = self.last_id;
                self.insert(id, &tokens);
                self.clusters.insert(id, Cluster { id, tokens, size: 1 });
                (id, Change::Created)
            }
        };

        self.dirty.insert(id);
        (&self.clusters[&id], change)
    }

    pub fn template(&self, id: u64) -> Option<String> {
        self.clusters.get(&id).map(Cluster::template)
    }

    /// All clusters, by id.
    pub fn clusters(&self) -> Vec<Cluster> {
        let mut all: Vec<Cluster> = self.clusters.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Clusters touched since the last call to [`Drain::clear_dirty`].
    pub fn dirty(&self) -> Vec<Cluster> {
        self.dirty.iter().filter_map(|id| self.clusters.get(id)).cloned().collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    fn prefix_len(&self, token_count: usize) -> usize {
        self.prefix_depth.min(token_count.saturating_sub(1))
    }

    fn search(&self, tokens: &[String]) -> Option<u64> {
        let mut node = self.roots.get(&tokens.len())?;
        for token in &tokens[..self.prefix_len(tokens.len())] {
            node = node
                .children
                .get(token.as_str())
                .or_else(|| node.children.get(WILDCARD))?;
        }

        let mut best: Option<(u64, f64, usize)> = None;
        for id in &node.clusters {
            let Some(cluster) = self.clusters.get(id) else {
                continue;
            };
            let (sim, params) = similarity(&cluster.tokens, tokens);
            let better = match best {
                None => true,
                Some((_, best_sim, best_params)) => sim > best_sim || (sim == best_sim && params > best_params),
            };
            if better {
                best = Some((*id, sim, params));
            }
        }
        best.filter(|(_, sim, _)| *sim >= self.similarity).map(|(id, _, _)| id)
    }

    fn insert(&mut self, id: u64, tokens: &[String]) {
        let prefix = self.prefix_len(tokens.len());
        let max_children = self.max_children;
        let mut node = self.roots.entry(tokens.len()).or_default();
        for token in &tokens[..prefix] {
            let key = child_key(node, token, max_children);
            node = node.children.entry(key).or_default();
        }
        node.clusters.push(id);
    }
}

/// Branch a token takes when a cluster is inserted. Tokens carrying digits
/// and tokens past a full node share the wildcard branch.
fn child_key(node: &Node, token: &str, max_children: usize) -> String {
    if node.children.contains_key(token) {
        return token.to_string();
    }
    if token.chars().any(|c| c.is_ascii_digit()) {
        return WILDCARD.to_string();
    }
    let room = if node.children.contains_key(WILDCARD) {
        node.children.len() < max_children
    } else {
        node.children.len() + 1 < max_children
    };
    if room {
        token.to_string()
    } else {
        WILDCARD.to_string()
    }
}

/// Share of positions equal to the template, and the template's wildcard
/// count. Wildcards do not count as equal.
fn similarity(template: &[String], tokens: &[String]) -> (f64, usize) {
    if template.is_empty() {
        return (1.0, 0);
    }
    let mut equal = 0usize;
    let mut params = 0usize;
    for (t, token) in template.iter().zip(tokens) {
        if t == WILDCARD {
            params += 1;
        } else if t == token {
            equal += 1;
        }
    }
    (equal as f64 / template.len() as f64, params)
}

fn merge(template: &[String], tokens: &[String]) -> Vec<String> {
    template
        .iter()
        .zip(tokens)
        .map(|(t, token)| if t == token { t.clone() } else { WILDCARD.to_string() })
        .collect()
}
