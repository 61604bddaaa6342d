use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::Result;
use crate::master::payload::{CurrentDispatch, NewDispatch, ServantPayload};
use crate::tickets::{Ticket, TicketSet};

/// Computes a new cluster-wide assignment from the observed one.
///
/// Implementations must not hand the same ticket ID to two servants and must
/// not lose an ID that still exists in their source of truth.
pub trait DispatchPolicy: Send + Sync {
    fn dispatch(&self, current: &CurrentDispatch) -> Result<NewDispatch>;
}

impl<F> DispatchPolicy for F
where
    F: Fn(&CurrentDispatch) -> Result<NewDispatch> + Send + Sync,
{
    fn dispatch(&self, current: &CurrentDispatch) -> Result<NewDispatch> {
        self(current)
    }
}

/// Source of the authoritative ticket set.
pub trait TicketSource: Send + Sync {
    fn tickets(&self) -> Result<Arc<TicketSet>>;
}

/// Shared, atomically replaceable authoritative ticket set.
#[derive(Default)]
pub struct AuthoritativeTickets {
    tickets: ArcSwap<TicketSet>,
}

impl AuthoritativeTickets {
    pub fn new(tickets: TicketSet) -> Self {
        Self {
            tickets: ArcSwap::from_pointee(tickets),
        }
    }

    pub fn snapshot(&self) -> Arc<TicketSet> {
        self.tickets.load_full()
    }

    pub fn replace(&self, tickets: TicketSet) {
        self.tickets.store(Arc::new(tickets));
    }

    /// Insert or overwrite a ticket by ID.
    pub fn insert(&self, ticket: Ticket) {
        self.tickets.rcu(|current| {
            let mut next = TicketSet::clone(current);
            next.remove(&ticket.id);
            next.push(ticket.clone());
            next
        });
    }

    /// Remove a ticket by ID; returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let previous = self.tickets.rcu(|current| {
            let mut next = TicketSet::clone(current);
            next.remove(id);
            next
        });
        previous.contains(id)
    }
}

impl TicketSource for AuthoritativeTickets {
    fn tickets(&self) -> Result<Arc<TicketSet>> {
        Ok(self.snapshot())
    }
}

/// Reference policy: every servant keeps up to the average of what it already
/// holds and only the surplus moves.
pub struct ConservativeAverageDispatch {
    source: Arc<dyn TicketSource>,
}

impl ConservativeAverageDispatch {
    pub fn new(source: Arc<dyn TicketSource>) -> Self {
        Self { source }
    }
}

impl DispatchPolicy for ConservativeAverageDispatch {
    fn dispatch(&self, current: &CurrentDispatch) -> Result<NewDispatch> {
        let tickets = self.source.tickets()?;
        let new_dispatch = conservative_average(&tickets, current);
        tracing::debug!(
            tickets = tickets.len(),
            servants = current.servant_count(),
            "Computed conservative average dispatch"
        );
        Ok(new_dispatch)
    }
}

/// Balance `tickets` over the servants of `current` so that each ends with
/// `max(1, tickets / servants)` or one more, moving as little as possible.
///
/// Held tickets missing from `tickets` are treated as deleted. A ticket held
/// by several servants stays with the first one in discovery order.
pub fn conservative_average(tickets: &TicketSet, current: &CurrentDispatch) -> NewDispatch {
    let servant_count = current.servant_count();
    if servant_count == 0 {
        return NewDispatch::default();
    }
    let average = (tickets.len() / servant_count).max(1);

    let mut unclaimed: HashMap<&str, &Ticket> =
        tickets.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut payloads: Vec<ServantPayload> = current
        .servant_payloads
        .iter()
        .map(|held| {
            let mut kept = TicketSet::new();
            for ticket in held.tickets.iter() {
                if kept.len() == average {
                    break;
                }
                if let Some(authoritative) = unclaimed.remove(ticket.id.as_str()) {
                    kept.push(authoritative.clone());
                }
            }
            ServantPayload::new(held.servant_id.clone(), kept)
        })
        .collect();

    payloads.sort_by_key(|p| p.tickets.len());
    let mut remaining: Vec<Ticket> = unclaimed.into_values().cloned().collect();
    remaining.sort_by(|a, b| a.id.cmp(&b.id));

    let mut remain_count = remaining.len();
    for payload in payloads.iter_mut().rev() {
        if remain_count == 0 {
            break;
        }
        let take = average
            .saturating_sub(payload.tickets.len())
            .min(remain_count);
        if take > 0 {
            payload
                .tickets
                .extend(remaining[remain_count - take..remain_count].iter().cloned());
            remain_count -= take;
        }
    }

    for (i, ticket) in remaining[..remain_count].iter().enumerate() {
        payloads[i % servant_count].tickets.push(ticket.clone());
    }

    NewDispatch::new(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn ticket_set(ids: &[&str]) -> TicketSet {
        ids.iter().map(|id| Ticket::persistent(*id, Vec::<u8>::new())).collect()
    }

    fn numbered(n: usize) -> TicketSet {
        (0..n)
            .map(|i| Ticket::persistent(format!("t{:03}", i), Vec::<u8>::new()))
            .collect()
    }

    fn current(servants: &[(&str, &[&str])]) -> CurrentDispatch {
        CurrentDispatch::new(
            servants
                .iter()
                .map(|(id, held)| ServantPayload::new(*id, ticket_set(held)))
                .collect(),
        )
    }

    fn held_by<'a>(dispatch: &'a NewDispatch, servant: &str) -> Vec<&'a str> {
        dispatch.get(servant).unwrap().tickets.ids()
    }

    fn assert_no_duplicates(dispatch: &NewDispatch) {
        let mut seen = HashSet::new();
        for p in &dispatch.servant_payloads {
            for id in p.tickets.ids() {
                assert!(seen.insert(id.to_string()), "ticket {} assigned twice", id);
            }
        }
    }

    #[test]
    fn no_servants_is_a_noop() {
        let result = conservative_average(&numbered(3), &CurrentDispatch::default());
        assert!(result.servant_payloads.is_empty());
        assert!(!result.force_flush);
    }

    #[test]
    fn every_servant_gets_average_or_one_more() {
        for n in 0..25 {
            for s in 1..7 {
                let names: Vec<String> = (0..s).map(|i| format!("s{}", i)).collect();
                let current = CurrentDispatch::new(
                    names
                        .iter()
                        .map(|name| ServantPayload::new(name.clone(), TicketSet::new()))
                        .collect(),
                );
                let result = conservative_average(&numbered(n), &current);

                let floor = n / s;
                let total: usize = result.servant_payloads.iter().map(|p| p.tickets.len()).sum();
                assert_eq!(total, n, "n={} s={}", n, s);
                for p in &result.servant_payloads {
                    let len = p.tickets.len();
                    assert!(len == floor || len == floor + 1, "n={} s={} len={}", n, s, len);
                }
                assert_no_duplicates(&result);
            }
        }
    }

    #[test]
    fn balances_any_prior_holdings() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..400 {
            let n = rng.gen_range(0..30);
            let s = rng.gen_range(1..8);
            let all = numbered(n);
            // Held IDs may have been deleted from the source since
            let universe: Vec<String> = (0..n + 5).map(|i| format!("t{:03}", i)).collect();
            let current = CurrentDispatch::new(
                (0..s)
                    .map(|i| {
                        let count = if rng.gen_bool(0.2) {
                            universe.len()
                        } else {
                            rng.gen_range(0..=universe.len() / 2)
                        };
                        let held: Vec<&str> = universe
                            .choose_multiple(&mut rng, count)
                            .map(String::as_str)
                            .collect();
                        ServantPayload::new(format!("s{}", i), ticket_set(&held))
                    })
                    .collect(),
            );
            let result = conservative_average(&all, &current);

            let floor = n / s;
            let total: usize = result.servant_payloads.iter().map(|p| p.tickets.len()).sum();
            assert_eq!(total, n, "n={} s={}", n, s);
            for p in &result.servant_payloads {
                let len = p.tickets.len();
                assert!(len == floor || len == floor + 1, "n={} s={} len={}", n, s, len);
                assert!(p.tickets.iter().all(|t| all.contains(&t.id)));
            }
            assert_no_duplicates(&result);

            // The first `average` still-valid tickets a servant held stay put
            let average = floor.max(1);
            let mut claimed = HashSet::new();
            for held in &current.servant_payloads {
                let kept: Vec<&str> = held
                    .tickets
                    .ids()
                    .into_iter()
                    .filter(|id| all.contains(id) && !claimed.contains(*id))
                    .take(average)
                    .collect();
                let assigned = held_by(&result, &held.servant_id);
                for id in kept {
                    assert!(assigned.contains(&id), "{} moved away from {}", id, held.servant_id);
                    claimed.insert(id);
                }
            }
        }
    }

    #[test]
    fn five_tickets_two_servants_one_empty() {
        let all = ticket_set(&["1", "2", "3", "4", "5"]);
        let current = current(&[("a", &[]), ("b", &["1", "2", "3", "4", "5"])]);
        let result = conservative_average(&all, &current);

        let a = held_by(&result, "a");
        let b = held_by(&result, "b");
        assert_eq!(a.len() + b.len(), 5);
        assert!(a.len() == 2 || a.len() == 3);
        // b keeps the first `average` tickets it already held
        assert_eq!(&b[..2], &["1", "2"]);
        assert_no_duplicates(&result);
    }

    #[test]
    fn tickets_within_average_never_move() {
        let all = numbered(9);
        let ids: Vec<String> = all.ids().into_iter().map(String::from).collect();
        let current = CurrentDispatch::new(vec![
            ServantPayload::new("a", ticket_set(&[&ids[0], &ids[1]])),
            ServantPayload::new("b", ticket_set(&[&ids[2], &ids[3], &ids[4], &ids[5], &ids[6]])),
            ServantPayload::new("c", TicketSet::new()),
        ]);
        let result = conservative_average(&all, &current);

        let a = held_by(&result, "a");
        assert!(a.contains(&ids[0].as_str()) && a.contains(&ids[1].as_str()));
        let b = held_by(&result, "b");
        for id in &ids[2..5] {
            assert!(b.contains(&id.as_str()), "{} moved away from b", id);
        }
        for p in &result.servant_payloads {
            assert_eq!(p.tickets.len(), 3);
        }
    }

    #[test]
    fn deleted_tickets_are_dropped() {
        let all = ticket_set(&["1", "2", "4"]);
        let current = current(&[("a", &["1", "2", "3"]), ("b", &["4"])]);
        let result = conservative_average(&all, &current);

        for p in &result.servant_payloads {
            assert!(!p.tickets.contains("3"));
        }
        let total: usize = result.servant_payloads.iter().map(|p| p.tickets.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn ticket_held_twice_stays_with_first_servant() {
        let all = ticket_set(&["1", "2"]);
        let current = current(&[("a", &["1"]), ("b", &["1"])]);
        let result = conservative_average(&all, &current);

        assert_eq!(held_by(&result, "a"), vec!["1"]);
        assert_eq!(held_by(&result, "b"), vec!["2"]);
    }

    #[test]
    fn fewer_tickets_than_servants() {
        let all = ticket_set(&["1", "2"]);
        let current = current(&[("a", &[]), ("b", &[]), ("c", &["2"])]);
        let result = conservative_average(&all, &current);

        assert_eq!(held_by(&result, "c"), vec!["2"]);
        let total: usize = result.servant_payloads.iter().map(|p| p.tickets.len()).sum();
        assert_eq!(total, 2);
        assert!(result.servant_payloads.iter().all(|p| p.tickets.len() <= 1));
    }

    #[test]
    fn authoritative_content_replaces_held_content() {
        let all: TicketSet = vec![Ticket::persistent("1", b"fresh".to_vec())].into();
        let current = CurrentDispatch::new(vec![ServantPayload::new(
            "a",
            vec![Ticket::persistent("1", b"stale".to_vec())].into(),
        )]);
        let result = conservative_average(&all, &current);
        assert_eq!(
            result.get("a").unwrap().tickets.get("1").unwrap().content,
            b"fresh".to_vec()
        );
    }

    #[test]
    fn policy_reads_source_every_call() {
        let source = Arc::new(AuthoritativeTickets::new(ticket_set(&["1", "2"])));
        let policy = ConservativeAverageDispatch::new(source.clone());
        let current = current(&[("a", &["1", "2"])]);

        assert_eq!(policy.dispatch(&current).unwrap().get("a").unwrap().tickets.len(), 2);
        assert!(source.remove("2"));
        assert!(!source.remove("2"));
        assert_eq!(held_by(&policy.dispatch(&current).unwrap(), "a"), vec!["1"]);

        source.insert(Ticket::ephemeral("9", Vec::<u8>::new()));
        assert_eq!(policy.dispatch(&current).unwrap().get("a").unwrap().tickets.len(), 2);
    }

    #[test]
    fn closures_are_policies() {
        let policy = |current: &CurrentDispatch| -> Result<NewDispatch> {
            Ok(NewDispatch::forced(current.servant_payloads.clone()))
        };
        let result = policy.dispatch(&current(&[("a", &["1"])])).unwrap();
        assert!(result.force_flush);
    }
}
