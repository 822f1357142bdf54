//! Distance-vector routing.
//!
//! Every node keeps one least-weight route per known destination and
//! advertises its table to its neighbors, omitting the entries a neighbor
//! would route back through itself (split horizon). The table is rebuilt
//! wholesale whenever a link weight or a neighbor advertisement changes.

use std::collections::BTreeMap;

/// Rounds to three decimals, the precision every weight in the system is
/// kept at.
pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Weight of a link with the given (already rounded) loss rate.
///
/// `1 / (1 - rate)` is the expected number of transmissions per delivered
/// packet, rounded to three decimals like everything else.
pub fn link_weight(loss_rate: f64) -> f64 {
    round3(1.0 / (1.0 - loss_rate))
}

/// One routing table entry: reach `dest` through `next_hop` at `weight`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Route {
    pub dest: u16,
    pub next_hop: u16,
    pub weight: f64,
}

impl Route {
    /// Creates an entry, rounding the weight to three decimals.
    pub fn new(dest: u16, next_hop: u16, weight: f64) -> Self {
        Route {
            dest,
            next_hop,
            weight: round3(weight),
        }
    }

    /// Whether the destination is reached directly over the link to it.
    pub fn is_direct(&self) -> bool {
        self.dest == self.next_hop
    }
}

/// The node's routing table.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: BTreeMap<u16, Route>,
}

impl RoutingTable {
    /// Rebuilds the table from the direct link weights and the latest
    /// advertisement of each neighbor. Returns whether any entry changed.
    ///
    /// Direct entries seed the table; a path through a neighbor replaces an
    /// entry only when strictly cheaper. Neighbors are walked in ascending
    /// port order, so equal-weight ties always resolve to the lowest port.
    pub fn recompute(
        &mut self,
        links: &BTreeMap<u16, f64>,
        adverts: &BTreeMap<u16, Vec<Route>>,
    ) -> bool {
        let mut routes: BTreeMap<u16, Route> = links
            .iter()
            .map(|(&port, &weight)| (port, Route::new(port, port, weight)))
            .collect();
        for (&via, advert) in adverts {
            let link = match links.get(&via) {
                Some(&link) => link,
                None => continue,
            };
            for ad in advert {
                // each candidate sum is rounded on its own
                let candidate = Route::new(ad.dest, via, ad.weight + link);
                let better = match routes.get(&candidate.dest) {
                    Some(current) => candidate.weight < current.weight,
                    None => true,
                };
                if better {
                    routes.insert(candidate.dest, candidate);
                }
            }
        }
        let changed = routes != self.routes;
        self.routes = routes;
        changed
    }

    /// Next hop toward `dest`, if the destination is reachable.
    pub fn next_hop(&self, dest: u16) -> Option<u16> {
        self.routes.get(&dest).map(|route| route.next_hop)
    }

    /// The advertisement for the neighbor at `to`: every entry that neither
    /// leads to nor routes through that neighbor.
    pub fn advertisement(&self, to: u16) -> Vec<Route> {
        self.routes
            .values()
            .filter(|route| route.dest != to && route.next_hop != to)
            .copied()
            .collect()
    }

    /// All entries, in ascending destination order.
    pub fn routes(&self) -> Vec<Route> {
        self.routes.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(pairs: &[(u16, f64)]) -> BTreeMap<u16, f64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn rounding() {
        assert_eq!(round3(0.12345), 0.123);
        assert_eq!(round3(0.12351), 0.124);
        assert_eq!(link_weight(0.0), 1.0);
        assert_eq!(link_weight(0.5), 2.0);
        assert_eq!(link_weight(0.2), 1.25);
        assert_eq!(link_weight(0.7), 3.333);
    }

    #[test]
    fn direct_links_seed_the_table() {
        let mut table = RoutingTable::default();
        let changed = table.recompute(&links(&[(8002, 2.0), (8003, 1.25)]), &BTreeMap::new());
        assert!(changed);
        assert_eq!(
            table.routes(),
            vec![Route::new(8002, 8002, 2.0), Route::new(8003, 8003, 1.25)]
        );
        assert_eq!(table.next_hop(8002), Some(8002));
        assert_eq!(table.next_hop(9999), None);
    }

    #[test]
    fn recompute_is_idempotent() {
        let mut table = RoutingTable::default();
        let links = links(&[(8002, 2.0)]);
        let mut adverts = BTreeMap::new();
        adverts.insert(8002, vec![Route::new(8003, 8003, 1.25)]);
        assert!(table.recompute(&links, &adverts));
        assert!(!table.recompute(&links, &adverts));
    }

    #[test]
    fn indirect_route_adds_link_weight() {
        // chain A--B--C with loss 0.5 and 0.2: A reaches C via B at
        // 2.0 + 1.25 = 3.25
        let mut table = RoutingTable::default();
        let links = links(&[(8002, link_weight(0.5))]);
        let mut adverts = BTreeMap::new();
        adverts.insert(8002, vec![Route::new(8003, 8003, link_weight(0.2))]);
        table.recompute(&links, &adverts);
        assert_eq!(
            table.routes(),
            vec![Route::new(8002, 8002, 2.0), Route::new(8003, 8002, 3.25)]
        );
    }

    #[test]
    fn cheaper_path_replaces_direct_link() {
        let mut table = RoutingTable::default();
        let links = links(&[(8002, 2.0), (8003, 5.0)]);
        let mut adverts = BTreeMap::new();
        adverts.insert(8002, vec![Route::new(8003, 8003, 1.0)]);
        table.recompute(&links, &adverts);
        assert_eq!(table.next_hop(8003), Some(8002));
    }

    #[test]
    fn equal_weight_path_does_not_replace() {
        let mut table = RoutingTable::default();
        let links = links(&[(8002, 1.0), (8003, 2.0)]);
        let mut adverts = BTreeMap::new();
        adverts.insert(8002, vec![Route::new(8003, 8003, 1.0)]);
        table.recompute(&links, &adverts);
        assert_eq!(table.next_hop(8003), Some(8003));
    }

    #[test]
    fn ties_resolve_to_the_lowest_neighbor_port() {
        let mut table = RoutingTable::default();
        let links = links(&[(8002, 1.0), (8003, 1.0)]);
        let mut adverts = BTreeMap::new();
        adverts.insert(8003, vec![Route::new(8004, 8004, 1.0)]);
        adverts.insert(8002, vec![Route::new(8004, 8004, 1.0)]);
        table.recompute(&links, &adverts);
        assert_eq!(table.next_hop(8004), Some(8002));
    }

    #[test]
    fn withdrawn_advertisement_is_a_change() {
        let mut table = RoutingTable::default();
        let links = links(&[(8002, 2.0)]);
        let mut adverts = BTreeMap::new();
        adverts.insert(8002, vec![Route::new(8003, 8003, 1.25)]);
        table.recompute(&links, &adverts);
        adverts.insert(8002, vec![]);
        assert!(table.recompute(&links, &adverts));
        assert_eq!(table.next_hop(8003), None);
    }

    #[test]
    fn advertisement_applies_split_horizon() {
        let mut table = RoutingTable::default();
        let links = links(&[(8002, 2.0), (8004, 1.0)]);
        let mut adverts = BTreeMap::new();
        adverts.insert(8002, vec![Route::new(8003, 8003, 1.25)]);
        table.recompute(&links, &adverts);
        // everything toward 8002 and 8002 itself is omitted
        assert_eq!(
            table.advertisement(8002),
            vec![Route::new(8004, 8004, 1.0)]
        );
        assert_eq!(
            table.advertisement(8004),
            vec![Route::new(8002, 8002, 2.0), Route::new(8003, 8002, 3.25)]
        );
    }
}
