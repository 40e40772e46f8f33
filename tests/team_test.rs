//! Team splitting end-to-end tests over the in-process simulation world.
//!
//! Run with: cargo test --test team_test

use pgasrt::sim::SimWorld;
use pgasrt::{team_my_pe, Team, TeamError, TeamManager};
use std::thread;

/// Run `body` on every PE of an `npes`-sized world and collect the results
/// in rank order.
fn run_world<T, F>(npes: usize, teams_max: usize, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, &SimWorld, &mut TeamManager) -> T + Send + Sync + 'static,
{
    let world = SimWorld::new(npes);
    let body = std::sync::Arc::new(body);
    let handles: Vec<_> = (0..npes)
        .map(|pe| {
            let world = world.clone();
            let body = body.clone();
            thread::spawn(move || {
                let sim = world.pe(pe);
                let mut mgr =
                    TeamManager::init(teams_max, pe, npes, sim.heap, sim.collectives).unwrap();
                body(pe, &world, &mut mgr)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

// =============================================================================
// STRIDED SPLIT
// =============================================================================

#[test]
fn strided_split_selects_even_pes() {
    // N=4: split (start=0, stride=2, size=2) selects PEs 0 and 2.
    let results = run_world(4, 16, |_pe, _world, mgr| {
        let world_team = mgr.world().clone();
        let team = mgr.split_strided(&world_team, 0, 2, 2, None, 0).unwrap();
        (team, mgr.reservation_mask())
    });

    let (teams, masks): (Vec<Option<Team>>, Vec<u64>) = results.into_iter().unzip();

    // PEs 0 and 2 are members with psync slot 1; PEs 1 and 3 hold null.
    assert_eq!(team_my_pe(teams[0].as_ref()), 0);
    assert_eq!(team_my_pe(teams[2].as_ref()), 1);
    assert!(teams[1].is_none());
    assert!(teams[3].is_none());
    for team in teams.iter().flatten() {
        assert_eq!(team.psync_idx(), 1);
        assert_eq!(team.n_pes(), 2);
        assert_eq!(team.start(), 0);
        assert_eq!(team.stride(), 2);
    }

    // Slots 0 (world) and 1 (the new team) are reserved on every PE.
    for mask in masks {
        assert_eq!(mask, !0u64 << 2);
    }
}

#[test]
fn consecutive_splits_draw_consecutive_slots() {
    let results = run_world(4, 16, |pe, _world, mgr| {
        let world_team = mgr.world().clone();
        let evens = mgr.split_strided(&world_team, 0, 2, 2, None, 0).unwrap();
        let odds = mgr.split_strided(&world_team, 1, 2, 2, None, 0).unwrap();
        (pe, evens, odds, mgr.reservation_mask())
    });

    for (pe, evens, odds, mask) in results {
        if pe % 2 == 0 {
            assert_eq!(evens.as_ref().unwrap().psync_idx(), 1);
            assert!(odds.is_none());
        } else {
            assert!(evens.is_none());
            assert_eq!(odds.as_ref().unwrap().psync_idx(), 2);
        }
        assert_eq!(mask, !0u64 << 3);
    }
}

#[test]
fn member_ranks_form_the_arithmetic_progression() {
    let results = run_world(6, 16, |pe, _world, mgr| {
        let world_team = mgr.world().clone();
        let team = mgr.split_strided(&world_team, 1, 2, 3, None, 0).unwrap();
        (pe, team)
    });

    // Members are world ranks 1, 3, 5.
    for (pe, team) in results {
        match pe {
            1 | 3 | 5 => {
                let team = team.unwrap();
                assert_eq!(team.world_pe(team.my_pe()), pe);
                for i in 0..team.n_pes() {
                    assert_eq!(team.world_pe(i), 1 + 2 * i);
                }
            }
            _ => assert!(team.is_none()),
        }
    }
}

#[test]
fn split_of_a_child_team_uses_world_numbering() {
    // Split {0,2,4} out of N=6, then halve it to {0,4} through the child.
    let results = run_world(6, 16, |_pe, _world, mgr| {
        let world_team = mgr.world().clone();
        let child = mgr.split_strided(&world_team, 0, 2, 3, None, 0).unwrap();
        let grandchild = match &child {
            Some(team) => {
                let team = team.clone();
                mgr.split_strided(&team, 0, 4, 2, None, 0).unwrap()
            }
            None => None,
        };
        (child, grandchild, mgr.reservation_mask())
    });

    let grandchild_members: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, (_, g, _))| g.is_some())
        .map(|(pe, _)| pe)
        .collect();
    assert_eq!(grandchild_members, vec![0, 4]);

    // Child members (0, 2, 4) performed two reservations; the rest saw one.
    for (pe, (child, _g, mask)) in results.iter().enumerate() {
        if child.is_some() {
            assert_eq!(*mask, !0u64 << 3, "pe {pe}");
        } else {
            assert_eq!(*mask, !0u64 << 2, "pe {pe}");
        }
    }
}

#[test]
fn exhausted_pool_is_reported() {
    // teams_max=2 leaves exactly one free slot after the world team.
    let results = run_world(2, 2, |_pe, _world, mgr| {
        let world_team = mgr.world().clone();
        let first = mgr.split_strided(&world_team, 0, 1, 2, None, 0).unwrap();
        assert!(first.is_some());
        mgr.split_strided(&world_team, 0, 1, 2, None, 0)
    });

    for result in results {
        assert!(matches!(result, Err(TeamError::TeamsExhausted(2))));
    }
}

// =============================================================================
// 2-D SPLIT
// =============================================================================

#[test]
fn grid_split_places_every_pe_once() {
    // N=6, xrange=3: x-teams {0,1,2} and {3,4,5}; y-teams {0,3}, {1,4}, {2,5}.
    let results = run_world(6, 16, |pe, _world, mgr| {
        let world_team = mgr.world().clone();
        let (x, y) = mgr.split_2d(&world_team, 3, None, 0, None, 0).unwrap();
        (pe, x, y, mgr.reservation_mask())
    });

    for (pe, x, y, mask) in results {
        let x = x.expect("every PE joins one x-team");
        let y = y.expect("every PE joins one y-team");

        // Contiguous x runs.
        assert_eq!(x.start(), (pe / 3) * 3);
        assert_eq!(x.stride(), 1);
        assert_eq!(x.n_pes(), 3);
        assert_eq!(x.my_pe(), pe % 3);

        // Column y teams.
        assert_eq!(y.start(), pe % 3);
        assert_eq!(y.stride(), 3);
        assert_eq!(y.n_pes(), 2);
        assert_eq!(y.my_pe(), pe / 3);

        // Disjoint x-teams share slot 1; disjoint y-teams share slot 2.
        assert_eq!(x.psync_idx(), 1);
        assert_eq!(y.psync_idx(), 2);
        assert_eq!(mask, !0u64 << 3);
    }
}

#[test]
fn grid_split_handles_a_short_trailing_xteam() {
    // N=5, xrange=3: x-teams {0,1,2} and {3,4}; y-teams {0,3}, {1,4}, {2}.
    let results = run_world(5, 16, |pe, _world, mgr| {
        let world_team = mgr.world().clone();
        let (x, y) = mgr.split_2d(&world_team, 3, None, 0, None, 0).unwrap();
        (pe, x.unwrap(), y.unwrap())
    });

    for (pe, x, y) in results {
        if pe < 3 {
            assert_eq!(x.n_pes(), 3);
            assert_eq!(x.my_pe(), pe);
        } else {
            assert_eq!(x.n_pes(), 2);
            assert_eq!(x.my_pe(), pe - 3);
        }
        // Columns 0 and 1 pick up the remainder.
        let expected_len = if pe % 3 < 2 { 2 } else { 1 };
        assert_eq!(y.n_pes(), expected_len);
    }
}

// =============================================================================
// TRANSLATION
// =============================================================================

#[test]
fn translate_between_sibling_teams() {
    let results = run_world(4, 16, |_pe, _world, mgr| {
        let world_team = mgr.world().clone();
        let evens = mgr.split_strided(&world_team, 0, 2, 2, None, 0).unwrap();
        let all = mgr.split_strided(&world_team, 0, 1, 4, None, 0).unwrap();
        (evens, all)
    });

    // Use PE 0's handles; translation is pure arithmetic on team shapes.
    let world = SimWorld::new(1);
    let sim = world.pe(0);
    let mgr = TeamManager::init(16, 0, 4, sim.heap, sim.collectives).unwrap();

    let (evens, all) = &results[0];
    let evens = evens.as_ref().unwrap();
    let all = all.as_ref().unwrap();

    assert_eq!(mgr.translate_pe(evens, 0, all), Some(0));
    assert_eq!(mgr.translate_pe(evens, 1, all), Some(2));
    assert_eq!(mgr.translate_pe(all, 2, evens), Some(1));
    assert_eq!(mgr.translate_pe(all, 1, evens), None);
    // Out of range in the source team.
    assert_eq!(mgr.translate_pe(evens, 2, all), None);
}

// =============================================================================
// DESTROY SEMANTICS
// =============================================================================

#[test]
fn destroy_does_not_return_the_psync_slot() {
    let results = run_world(2, 16, |_pe, _world, mgr| {
        let world_team = mgr.world().clone();
        let team = mgr.split_strided(&world_team, 0, 1, 2, None, 0).unwrap();
        mgr.destroy(team.unwrap());
        let mask_after_destroy = mgr.reservation_mask();

        // A later split draws the next slot, not the destroyed one.
        let again = mgr.split_strided(&world_team, 0, 1, 2, None, 0).unwrap();
        (mask_after_destroy, again.unwrap().psync_idx())
    });

    for (mask, next_idx) in results {
        assert_eq!(mask, !0u64 << 2, "destroy must not free the slot");
        assert_eq!(next_idx, 2);
    }
}
