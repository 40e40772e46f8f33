//! Teams and the pSync pool.
//!
//! A team is a strided subset of world PEs. Each team owns one index into a
//! globally reserved pool of pSync scratch slots; the pool holds two slots
//! per team index (two interleaved groups) so back-to-back collectives on
//! the same team never collide:
//!
//! ```text
//! [ (world) (1st team) (2nd team) … | (world) (1st team) (2nd team) … ]
//!   <---------- group 0 ----------->|<---------- group 1 ------------>
//! ```
//!
//! Slot reservation is a distributed agreement: a bitmask with one bit per
//! slot (1 = free) is held on every PE, AND-reduced across a new team's
//! members, and the least-significant set bit of the result is the team's
//! slot. At any quiescent point between collectives all PEs hold identical
//! masks, which is what lets non-members mirror a reservation they did not
//! participate in. Disjoint teams may share a slot index; their pSync words
//! live on disjoint PEs.

use crate::collectives::{
    ActiveSet, CollectiveError, Collectives, PsyncRef, SymHandle, SymmetricHeap,
};
use crate::config::TEAMS_MAX_LIMIT;
use crate::transport::{Context, CtxOptions, TransportError, TransportState};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Length of one pSync slot, in words. Provider-agnostic.
pub const SYNC_SIZE: usize = 64;

/// Value every pSync word holds outside a collective.
pub const SYNC_VALUE: i64 = -1;

/// Interleaved slot groups per team index.
pub const PSYNC_GROUPS: usize = 2;

#[derive(Debug, Error)]
pub enum TeamError {
    #[error("requested {requested} teams, but only {supported} are supported")]
    TooManyTeams { requested: usize, supported: usize },
    #[error("invalid team specification (start={start}, stride={stride}, size={size})")]
    InvalidSpec { start: usize, stride: usize, size: usize },
    #[error("no more teams available (max = {0}), try increasing PGASRT_TEAMS_MAX")]
    TeamsExhausted(usize),
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
    #[error(transparent)]
    Collective(#[from] CollectiveError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// User-adjustable team properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeamConfig {
    /// Contexts created against this team.
    pub num_contexts: i32,
}

/// A PE's handle on a team it belongs to. PEs outside the active set hold
/// no handle (the null team).
#[derive(Debug, Clone)]
pub struct Team {
    team_id: usize,
    start: usize,
    stride: usize,
    size: usize,
    my_pe: usize,
    psync_idx: usize,
    config: TeamConfig,
    config_mask: u64,
}

impl Team {
    pub fn team_id(&self) -> usize {
        self.team_id
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// This PE's rank within the team.
    pub fn my_pe(&self) -> usize {
        self.my_pe
    }

    pub fn n_pes(&self) -> usize {
        self.size
    }

    pub fn psync_idx(&self) -> usize {
        self.psync_idx
    }

    pub fn config(&self) -> TeamConfig {
        self.config
    }

    pub fn config_mask(&self) -> u64 {
        self.config_mask
    }

    pub fn active_set(&self) -> ActiveSet {
        ActiveSet { start: self.start, stride: self.stride, size: self.size }
    }

    /// World rank of team member `pe`.
    pub fn world_pe(&self, pe: usize) -> usize {
        self.start + pe * self.stride
    }
}

/// Null-team-aware accessors mirroring the user-facing API: absent handles
/// report −1.
pub fn team_my_pe(team: Option<&Team>) -> i64 {
    team.map_or(-1, |t| t.my_pe as i64)
}

pub fn team_n_pes(team: Option<&Team>) -> i64 {
    team.map_or(-1, |t| t.size as i64)
}

pub fn team_get_config(team: Option<&Team>) -> Option<TeamConfig> {
    team.map(|t| t.config)
}

/// Back-reference from a context to its team.
pub fn ctx_get_team(_ctx: &Context) -> Result<Team, TeamError> {
    Err(TeamError::Unimplemented("ctx_get_team"))
}

pub struct TeamManager {
    teams_max: usize,
    my_pe: usize,
    n_pes: usize,
    coll: Arc<dyn Collectives>,
    psync_pool: SymHandle,
    reserved_word: SymHandle,
    /// Local mirror of the symmetric reservation word; bit i set = slot i
    /// free. Bit 0 is permanently reserved for the world team.
    reserved_mask: u64,
    num_teams: usize,
    world: Team,
    finalized: bool,
}

impl std::fmt::Debug for TeamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamManager")
            .field("teams_max", &self.teams_max)
            .field("my_pe", &self.my_pe)
            .field("n_pes", &self.n_pes)
            .field("psync_pool", &self.psync_pool)
            .field("reserved_word", &self.reserved_word)
            .field("reserved_mask", &self.reserved_mask)
            .field("num_teams", &self.num_teams)
            .field("world", &self.world)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl TeamManager {
    /// Reserve slot 0 for the world team and stand up the pSync pool:
    /// `PSYNC_GROUPS × teams_max` slots of `SYNC_SIZE` words, all
    /// `SYNC_VALUE`, plus the reservation word.
    pub fn init(
        teams_max: usize,
        my_pe: usize,
        n_pes: usize,
        heap: Arc<dyn SymmetricHeap>,
        coll: Arc<dyn Collectives>,
    ) -> Result<Self, TeamError> {
        if teams_max == 0 || teams_max > TEAMS_MAX_LIMIT {
            return Err(TeamError::TooManyTeams {
                requested: teams_max,
                supported: TEAMS_MAX_LIMIT,
            });
        }

        let psync_pool = heap.alloc_words(PSYNC_GROUPS * SYNC_SIZE * teams_max, SYNC_VALUE)?;
        let reserved_word = heap.alloc_words(1, 0)?;

        // All slots free except slot 0.
        let reserved_mask = !0u64 << 1;

        let world = Team {
            team_id: 1,
            start: 0,
            stride: 1,
            size: n_pes,
            my_pe,
            psync_idx: 0,
            config: TeamConfig::default(),
            config_mask: 0,
        };

        Ok(TeamManager {
            teams_max,
            my_pe,
            n_pes,
            coll,
            psync_pool,
            reserved_word,
            reserved_mask,
            num_teams: 1,
            world,
            finalized: false,
        })
    }

    pub fn world(&self) -> &Team {
        &self.world
    }

    pub fn my_pe(&self) -> usize {
        self.my_pe
    }

    pub fn n_pes(&self) -> usize {
        self.n_pes
    }

    pub fn teams_max(&self) -> usize {
        self.teams_max
    }

    /// Current reservation mask. Identical on every PE at quiescent points.
    pub fn reservation_mask(&self) -> u64 {
        self.reserved_mask
    }

    /// Symmetric allocation holding the pSync pool.
    pub fn psync_pool_handle(&self) -> SymHandle {
        self.psync_pool
    }

    /// Symmetric allocation holding the reservation word.
    pub fn reservation_word_handle(&self) -> SymHandle {
        self.reserved_word
    }

    fn psync(&self, group: usize, idx: usize) -> PsyncRef {
        PsyncRef {
            handle: self.psync_pool,
            offset_words: (group * self.teams_max + idx) * SYNC_SIZE,
        }
    }

    /// Split `parent` into a child team over `(start, stride, size)` in
    /// world numbering. Collective over the parent: members of the child
    /// receive `Some(team)`, the rest `None`. Every parent PE clears the
    /// same reservation bit and re-synchronizes on the parent's group-1
    /// slot before returning.
    pub fn split_strided(
        &mut self,
        parent: &Team,
        start: usize,
        stride: usize,
        size: usize,
        config: Option<TeamConfig>,
        config_mask: u64,
    ) -> Result<Option<Team>, TeamError> {
        if size == 0
            || stride == 0
            || size > parent.size
            || start + (size - 1) * stride >= self.n_pes
        {
            return Err(TeamError::InvalidSpec { start, stride, size });
        }

        let child = ActiveSet { start, stride, size };
        let team_id = self.num_teams + 1;
        self.num_teams = team_id;

        let result = if let Some(my_idx) = child.index_of(self.my_pe) {
            // Reduce the reservation masks of the child's members, using
            // the parent's group-0 slot as scratch. AND across identical
            // masks is a no-op; the reduction synchronizes the members and
            // folds in any divergence left by earlier sibling splits.
            let reduced = self.coll.and_reduce_u64(
                child,
                self.reserved_mask,
                self.psync(0, parent.psync_idx),
            )?;
            self.reserved_mask = reduced;

            if self.reserved_mask == 0 {
                return Err(TeamError::TeamsExhausted(self.teams_max));
            }
            let psync_idx = self.reserved_mask.trailing_zeros() as usize;
            if psync_idx >= self.teams_max {
                return Err(TeamError::TeamsExhausted(self.teams_max));
            }
            self.reserved_mask &= !(1u64 << psync_idx);

            debug!(
                pe = self.my_pe,
                team_id, start, stride, size, psync_idx, "joined split team"
            );

            Some(Team {
                team_id,
                start,
                stride,
                size,
                my_pe: my_idx,
                psync_idx,
                config: config.unwrap_or_default(),
                config_mask,
            })
        } else {
            // Non-members mirror the reservation. Masks agree at quiescent
            // points, so the members' least-significant-set-bit choice is
            // reproducible locally, and so is exhaustion.
            let lsb = self.reserved_mask.trailing_zeros() as usize;
            if self.reserved_mask == 0 || lsb >= self.teams_max {
                return Err(TeamError::TeamsExhausted(self.teams_max));
            }
            self.reserved_mask &= !(1u64 << lsb);
            None
        };

        // No participant may reach a second split before everyone has
        // observed this reservation.
        self.coll
            .barrier(parent.active_set(), self.psync(1, parent.psync_idx))?;

        Ok(result)
    }

    /// Split `parent` into a grid: contiguous x-teams of up to `xrange`
    /// members and `xrange` strided y-teams covering the columns. Every
    /// parent PE lands in exactly one x-team and one y-team.
    pub fn split_2d(
        &mut self,
        parent: &Team,
        xrange: usize,
        xaxis_config: Option<TeamConfig>,
        xaxis_mask: u64,
        yaxis_config: Option<TeamConfig>,
        yaxis_mask: u64,
    ) -> Result<(Option<Team>, Option<Team>), TeamError> {
        if xrange == 0 || xrange > parent.size {
            return Err(TeamError::InvalidSpec {
                start: parent.start,
                stride: parent.stride,
                size: xrange,
            });
        }

        let parent_start = parent.start;
        let parent_stride = parent.stride;
        let parent_size = parent.size;

        let num_xteams = parent_size.div_ceil(xrange);
        let num_yteams = xrange;

        let mut xaxis_team = None;
        let mut start = parent_start;
        for i in 0..num_xteams {
            let num_xmembers = if i == num_xteams - 1 && parent_size % xrange != 0 {
                parent_size % xrange
            } else {
                xrange
            };

            let set = ActiveSet { start, stride: parent_stride, size: num_xmembers };
            if set.contains(self.my_pe) {
                xaxis_team = self.split_strided(
                    parent,
                    start,
                    parent_stride,
                    num_xmembers,
                    xaxis_config,
                    xaxis_mask,
                )?;
            }
            start += xrange * parent_stride;
        }

        let mut yaxis_team = None;
        let mut start = parent_start;
        let yrange = parent_size / xrange;
        let remainder = parent_size % xrange;
        for i in 0..num_yteams {
            let num_ymembers = if remainder != 0 && i < remainder { yrange + 1 } else { yrange };

            let set = ActiveSet {
                start,
                stride: xrange * parent_stride,
                size: num_ymembers,
            };
            if set.contains(self.my_pe) {
                yaxis_team = self.split_strided(
                    parent,
                    start,
                    xrange * parent_stride,
                    num_ymembers,
                    yaxis_config,
                    yaxis_mask,
                )?;
            }
            start += parent_stride;
        }

        self.coll
            .barrier(parent.active_set(), self.psync(1, parent.psync_idx))?;

        Ok((xaxis_team, yaxis_team))
    }

    /// Translate `src_pe` in `src` to the corresponding rank in `dest`.
    /// Defined when `src_pe ∈ [0, src.size)` and the member's world rank
    /// lies in `dest`'s active set.
    pub fn translate_pe(&self, src: &Team, src_pe: usize, dest: &Team) -> Option<usize> {
        if src_pe >= src.size {
            return None;
        }
        let world = src.world_pe(src_pe);
        if world >= self.n_pes {
            return None;
        }
        dest.active_set().index_of(world)
    }

    /// Release local team state. The pSync reservation bit is deliberately
    /// not returned to the pool: the members cannot agree on the release
    /// without a collective, so slots only grow scarcer over a run.
    pub fn destroy(&mut self, team: Team) {
        debug!(pe = self.my_pe, team_id = team.team_id, "destroying team");
        drop(team);
    }

    /// Create a communication context against `team`. The context is not
    /// yet associated with the team beyond the bookkeeping count.
    pub fn create_ctx(
        &mut self,
        team: &mut Team,
        transport: &TransportState,
        options: CtxOptions,
    ) -> Result<Arc<Context>, TeamError> {
        let ctx = transport.ctx_create(options)?;
        team.config.num_contexts += 1;
        Ok(ctx)
    }

    /// Synchronize the members of `team`.
    pub fn sync(&self, _team: &Team) -> Result<(), TeamError> {
        Err(TeamError::Unimplemented("team_sync"))
    }

    /// Release local teams state. Must run after all collectives have
    /// quiesced and before the symmetric heap is torn down; the pSync pool
    /// itself stays with the heap.
    pub fn fini(&mut self) {
        if self.finalized {
            return;
        }
        if self.reserved_mask.count_zeros() as usize > self.num_teams {
            warn!(
                pe = self.my_pe,
                "reservation mask accounts for more slots than teams created"
            );
        }
        self.finalized = true;
    }
}

impl Drop for TeamManager {
    fn drop(&mut self) {
        self.fini();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimWorld;

    fn manager(npes: usize) -> TeamManager {
        let world = SimWorld::new(npes);
        let sim = world.pe(0);
        TeamManager::init(16, 0, npes, sim.heap, sim.collectives).unwrap()
    }

    #[test]
    fn world_team_shape() {
        let mgr = manager(4);
        let world = mgr.world();
        assert_eq!(world.start(), 0);
        assert_eq!(world.stride(), 1);
        assert_eq!(world.n_pes(), 4);
        assert_eq!(world.psync_idx(), 0);
        assert_eq!(world.my_pe(), 0);
        // Bit 0 reserved for the world team, everything else free.
        assert_eq!(mgr.reservation_mask(), !0u64 << 1);
    }

    #[test]
    fn oversized_teams_max_fails_init() {
        let world = SimWorld::new(2);
        let sim = world.pe(0);
        let err = TeamManager::init(65, 0, 2, sim.heap, sim.collectives).unwrap_err();
        assert!(matches!(
            err,
            TeamError::TooManyTeams { requested: 65, supported: 64 }
        ));
    }

    #[test]
    fn invalid_split_spec_leaves_mask_untouched() {
        let mut mgr = manager(4);
        let world = mgr.world().clone();
        let before = mgr.reservation_mask();

        assert!(matches!(
            mgr.split_strided(&world, 0, 1, 0, None, 0),
            Err(TeamError::InvalidSpec { .. })
        ));
        assert!(matches!(
            mgr.split_strided(&world, 0, 0, 2, None, 0),
            Err(TeamError::InvalidSpec { .. })
        ));
        // Larger than the parent's population.
        assert!(matches!(
            mgr.split_strided(&world, 0, 1, 5, None, 0),
            Err(TeamError::InvalidSpec { .. })
        ));
        // Last member out of world range.
        assert!(matches!(
            mgr.split_strided(&world, 2, 2, 4, None, 0),
            Err(TeamError::InvalidSpec { .. })
        ));

        assert_eq!(mgr.reservation_mask(), before);
    }

    #[test]
    fn translate_pe_is_the_world_rank_inverse() {
        let mgr = manager(8);
        let src = Team {
            team_id: 2,
            start: 0,
            stride: 2,
            size: 4,
            my_pe: 0,
            psync_idx: 1,
            config: TeamConfig::default(),
            config_mask: 0,
        };
        let dest = Team {
            team_id: 3,
            start: 4,
            stride: 1,
            size: 4,
            my_pe: 0,
            psync_idx: 2,
            config: TeamConfig::default(),
            config_mask: 0,
        };

        // src members are world 0,2,4,6; dest members are world 4,5,6,7.
        assert_eq!(mgr.translate_pe(&src, 2, &dest), Some(0));
        assert_eq!(mgr.translate_pe(&src, 3, &dest), Some(2));
        assert_eq!(mgr.translate_pe(&src, 0, &dest), None);
        // src_pe out of [0, size) is undefined.
        assert_eq!(mgr.translate_pe(&src, 4, &dest), None);

        for i in 0..src.n_pes() {
            if let Some(j) = mgr.translate_pe(&src, i, &dest) {
                assert_eq!(src.world_pe(i), dest.world_pe(j));
            }
        }
    }

    #[test]
    fn null_team_accessors_report_minus_one() {
        let mgr = manager(2);
        assert_eq!(team_my_pe(None), -1);
        assert_eq!(team_n_pes(None), -1);
        assert_eq!(team_get_config(None), None);
        assert_eq!(team_my_pe(Some(mgr.world())), 0);
        assert_eq!(team_n_pes(Some(mgr.world())), 2);
    }

    #[test]
    fn sync_is_unimplemented() {
        let mgr = manager(2);
        assert!(matches!(
            mgr.sync(mgr.world()),
            Err(TeamError::Unimplemented("team_sync"))
        ));
    }
}
