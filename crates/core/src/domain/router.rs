//! Route computation across domains
//!
//! The router grows a tree rooted at the sink's domain by following gateways
//! against the direction of audio flow. Every tree node sitting in the
//! source's domain is the upstream end of one candidate path. Each path is
//! then expanded into concrete routes, one per admissible assignment of
//! connection formats to its hops.

use crate::domain::error::{Result, RoutingError};
use crate::domain::model::{
    ConnectionFormat, DomainId, Gateway, GatewayId, Route, RoutingElement, Sink, SinkId, Source,
    SourceId,
};
use crate::domain::topology::TopologyStore;
use std::cmp::Ordering;
use tracing::{debug, instrument, warn};

/// Ranking hook for computed routes
pub trait RoutePolicy {
    /// Order two candidate routes; `Less` means `a` is preferred
    fn compare(&self, a: &Route, b: &Route) -> Ordering {
        a.hop_count().cmp(&b.hop_count())
    }

    /// Reorder the admissible formats of one hop, most preferred first
    fn prioritize_formats(
        &self,
        _source: &Source,
        _sink: &Sink,
        _candidates: &mut Vec<ConnectionFormat>,
    ) {
    }
}

/// Fewest hops first, enumeration order otherwise
#[derive(Debug, Clone, Copy, Default)]
pub struct ShortestPath;

impl RoutePolicy for ShortestPath {}

#[derive(Debug, Clone)]
struct TreeNode {
    domain: DomainId,
    /// Gateway leading from this node's domain into the parent's domain
    gateway: Option<GatewayId>,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Arena of reachable domains, rooted at the sink's domain
#[derive(Debug, Clone)]
struct RouteTree {
    nodes: Vec<TreeNode>,
}

impl RouteTree {
    fn build<S: TopologyStore + ?Sized>(store: &S, root: DomainId, only_free: bool) -> Self {
        let mut tree = Self {
            nodes: vec![TreeNode {
                domain: root,
                gateway: None,
                parent: None,
                children: Vec::new(),
            }],
        };

        let mut pending = vec![0usize];
        while let Some(index) = pending.pop() {
            let domain = tree.nodes[index].domain;
            for gateway in store.gateways_into(domain) {
                if only_free && store.is_gateway_in_use(gateway) {
                    debug!(gateway = %gateway.id, "Skipping gateway in use");
                    continue;
                }
                let upstream = gateway.domain_sink_id;
                if tree.on_branch(index, upstream) {
                    continue;
                }
                let child = tree.nodes.len();
                tree.nodes.push(TreeNode {
                    domain: upstream,
                    gateway: Some(gateway.id),
                    parent: Some(index),
                    children: Vec::new(),
                });
                tree.nodes[index].children.push(child);
                pending.push(child);
            }
        }

        tree
    }

    /// Whether `domain` is `index` itself or one of its ancestors
    fn on_branch(&self, index: usize, domain: DomainId) -> bool {
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            if self.nodes[i].domain == domain {
                return true;
            }
            cursor = self.nodes[i].parent;
        }
        false
    }

    fn nodes_in(&self, domain: DomainId) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, node)| node.domain == domain)
            .map(|(index, _)| index)
    }

    /// Gateways from `index` up to the root, in audio-flow order
    fn gateway_path(&self, index: usize) -> Vec<GatewayId> {
        let mut path = Vec::new();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            if let Some(gateway) = self.nodes[i].gateway {
                path.push(gateway);
            }
            cursor = self.nodes[i].parent;
        }
        path
    }
}

struct Hop<'a> {
    source: &'a Source,
    sink: &'a Sink,
}

enum PathOutcome {
    Routes(Vec<Route>),
    Inconsistent,
}

/// Computes routes between a source and a sink
pub struct Router {
    policy: Box<dyn RoutePolicy>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_policy(Box::new(ShortestPath))
    }

    pub fn with_policy(policy: Box<dyn RoutePolicy>) -> Self {
        Self { policy }
    }

    /// Every admissible route from `source` to `sink`, best first
    ///
    /// With `only_free`, gateways already carrying a connection are not
    /// considered. Errors: `NonExistent` for unknown endpoints, `NotPossible`
    /// when no gateway path joins the domains, `WrongFormat` when paths exist
    /// but no format survives them, `Unknown` when the only paths reference
    /// endpoints missing from the store.
    #[instrument(skip(self, store))]
    pub fn find_routes<S: TopologyStore + ?Sized>(
        &self,
        store: &S,
        only_free: bool,
        source: SourceId,
        sink: SinkId,
    ) -> Result<Vec<Route>> {
        let source_entity = store.source(source).ok_or(RoutingError::NonExistent)?;
        let sink_entity = store.sink(sink).ok_or(RoutingError::NonExistent)?;

        let tree = RouteTree::build(store, sink_entity.domain_id, only_free);

        let mut routes = Vec::new();
        let mut paths = 0usize;
        let mut inconsistent = 0usize;

        for node in tree.nodes_in(source_entity.domain_id) {
            paths += 1;
            let gateways = tree.gateway_path(node);
            match self.expand_path(store, source_entity, sink_entity, &gateways) {
                PathOutcome::Routes(found) => routes.extend(found),
                PathOutcome::Inconsistent => inconsistent += 1,
            }
        }

        if !routes.is_empty() {
            routes.sort_by(|a, b| self.policy.compare(a, b));
            debug!(count = routes.len(), "Routes found");
            return Ok(routes);
        }

        match (paths, inconsistent) {
            (0, _) => Err(RoutingError::NotPossible),
            (p, i) if p == i => Err(RoutingError::Unknown),
            _ => Err(RoutingError::WrongFormat),
        }
    }

    fn expand_path<S: TopologyStore + ?Sized>(
        &self,
        store: &S,
        source: &Source,
        sink: &Sink,
        gateway_ids: &[GatewayId],
    ) -> PathOutcome {
        let mut gateways: Vec<&Gateway> = Vec::with_capacity(gateway_ids.len());
        let mut hops = Vec::with_capacity(gateway_ids.len() + 1);
        let mut hop_source = source;

        for id in gateway_ids {
            let Some(gateway) = store.gateway(*id) else {
                warn!(gateway = %id, "Gateway vanished during route computation");
                return PathOutcome::Inconsistent;
            };
            let (Some(input), Some(output)) =
                (store.sink(gateway.sink_id), store.source(gateway.source_id))
            else {
                warn!(gateway = %id, "Gateway endpoint missing from topology");
                return PathOutcome::Inconsistent;
            };
            hops.push(Hop {
                source: hop_source,
                sink: input,
            });
            gateways.push(gateway);
            hop_source = output;
        }
        hops.push(Hop {
            source: hop_source,
            sink,
        });

        let mut routes = Vec::new();
        let mut elements = Vec::with_capacity(hops.len());
        self.assign_formats(
            source.id,
            sink.id,
            &hops,
            &gateways,
            None,
            &mut elements,
            &mut routes,
        );
        PathOutcome::Routes(routes)
    }

    #[allow(clippy::too_many_arguments)]
    fn assign_formats(
        &self,
        source: SourceId,
        sink: SinkId,
        hops: &[Hop<'_>],
        gateways: &[&Gateway],
        previous: Option<ConnectionFormat>,
        elements: &mut Vec<RoutingElement>,
        routes: &mut Vec<Route>,
    ) {
        let index = elements.len();
        let Some(hop) = hops.get(index) else {
            routes.push(Route {
                source_id: source,
                sink_id: sink,
                elements: elements.clone(),
            });
            return;
        };

        let mut candidates = common_formats(hop.source, hop.sink);
        if let (Some(format), Some(gateway)) = (previous, index.checked_sub(1).map(|i| gateways[i]))
        {
            let allowed = gateway.convertible_from(format);
            candidates.retain(|f| allowed.contains(f));
        }
        self.policy
            .prioritize_formats(hop.source, hop.sink, &mut candidates);

        for format in candidates {
            elements.push(RoutingElement {
                source_id: hop.source.id,
                sink_id: hop.sink.id,
                domain_id: hop.sink.domain_id,
                format,
            });
            self.assign_formats(source, sink, hops, gateways, Some(format), elements, routes);
            elements.pop();
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn common_formats(source: &Source, sink: &Sink) -> Vec<ConnectionFormat> {
    let mut formats: Vec<ConnectionFormat> = source
        .formats
        .iter()
        .copied()
        .filter(|f| sink.supports(*f))
        .collect();
    formats.sort();
    formats.dedup();
    formats
}
