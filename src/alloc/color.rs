use std::collections::{HashMap, HashSet, VecDeque};

use itertools::Itertools;
use log::{debug, trace};

use crate::lir::{Phys, Proc, Reg};
use crate::opt::{liveness, tracked};

/// One coloring attempt. `spills` is empty on success; otherwise the
/// caller rewrites the spilled registers and tries again.
#[derive(Debug)]
pub struct Coloring {
    pub colors: HashMap<u32, Phys>,
    pub spills: Vec<Reg>,
}

/// The number of colors.
pub const K: usize = Phys::ALLOCATABLE.len();

/// Chaitin–Briggs coloring with conservative coalescing: build the
/// interference graph from per-instruction liveness, then simplify,
/// coalesce (Briggs or George), freeze and spill until the graph is empty,
/// and finally assign colors off the select stack. Spill-marked nodes that
/// happen to color are kept.
pub fn color(proc: &Proc, avoid_spilling: &HashSet<Reg>) -> Coloring {
    let mut state = State::new(proc, avoid_spilling);
    state.build();
    state.make_worklists();

    loop {
        if let Some(node) = state.simplify_worklist.pop() {
            state.simplify(node);
        } else if let Some(mv) = state.next_move() {
            state.coalesce(mv);
        } else if !state.freeze_worklist.is_empty() {
            state.freeze();
        } else if !state.spill_worklist.is_empty() {
            state.select_spill();
        } else {
            break;
        }
    }

    state.assign_colors()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MoveState {
    Worklist,
    Active,
    Coalesced,
    Constrained,
    Frozen,
}

struct State<'a> {
    proc: &'a Proc,

    /// Move instructions, as (dst, src), and their lifecycle state.
    moves: Vec<(Reg, Reg)>,
    move_states: Vec<MoveState>,
    move_list: HashMap<Reg, Vec<usize>>,
    pending_moves: VecDeque<usize>,

    adj_set: HashSet<(Reg, Reg)>,
    adj_list: HashMap<Reg, HashSet<Reg>>,
    degree: HashMap<Reg, usize>,

    simplify_worklist: Vec<Reg>,
    freeze_worklist: HashSet<Reg>,
    spill_worklist: HashSet<Reg>,

    select_stack: Vec<Reg>,
    on_stack: HashSet<Reg>,
    coalesced: HashSet<Reg>,
    alias: HashMap<Reg, Reg>,

    /// Rough spill metric: reads plus writes per node.
    activity: HashMap<Reg, usize>,
    /// Short-lived registers born from an earlier spill rewrite; spilled
    /// again only as a last resort.
    avoid_spilling: &'a HashSet<Reg>,
}

impl<'a> State<'a> {
    fn new(proc: &'a Proc, avoid_spilling: &'a HashSet<Reg>) -> Self {
        Self {
            proc,
            moves: Vec::new(),
            move_states: Vec::new(),
            move_list: HashMap::new(),
            pending_moves: VecDeque::new(),
            adj_set: HashSet::new(),
            adj_list: HashMap::new(),
            degree: HashMap::new(),
            simplify_worklist: Vec::new(),
            freeze_worklist: HashSet::new(),
            spill_worklist: HashSet::new(),
            select_stack: Vec::new(),
            on_stack: HashSet::new(),
            coalesced: HashSet::new(),
            alias: HashMap::new(),
            activity: HashMap::new(),
            avoid_spilling,
        }
    }

    fn is_precolored(reg: Reg) -> bool {
        matches!(reg, Reg::Phys(_))
    }

    /// Walk each block backwards from its live-out set; every definition
    /// interferes with everything live after it. Moves exempt their source
    /// so that the pair stays coalescible.
    fn build(&mut self) {
        let live_facts = liveness(self.proc);

        for (b, block) in self.proc.blocks.iter().enumerate() {
            let mut live: im::HashSet<Reg> = live_facts.live_out[b]
                .iter()
                .copied()
                .collect();

            for inst in block.insts.iter().rev() {
                let defs: Vec<Reg> = inst.defs().into_iter().filter(|r| tracked(*r)).collect();
                let uses: Vec<Reg> = inst.uses().into_iter().filter(|r| tracked(*r)).collect();

                for reg in defs.iter().chain(uses.iter()) {
                    if !Self::is_precolored(*reg) {
                        *self.activity.entry(*reg).or_insert(0) += 1;
                    }
                }

                if let Some((dst, src)) = inst.as_move() {
                    if tracked(dst) && tracked(src) {
                        live.remove(&src);

                        let id = self.moves.len();
                        self.moves.push((dst, src));
                        self.move_states.push(MoveState::Worklist);
                        self.pending_moves.push_back(id);
                        self.move_list.entry(dst).or_default().push(id);
                        self.move_list.entry(src).or_default().push(id);
                    }
                }

                for def in &defs {
                    live.insert(*def);
                }
                for def in &defs {
                    for other in live.iter() {
                        self.add_edge(*def, *other);
                    }
                }

                for def in &defs {
                    live.remove(def);
                }
                for used in &uses {
                    live.insert(*used);
                }
            }
        }
    }

    fn add_edge(&mut self, u: Reg, v: Reg) {
        if u == v || self.adj_set.contains(&(u, v)) {
            return;
        }
        self.adj_set.insert((u, v));
        self.adj_set.insert((v, u));

        if !Self::is_precolored(u) {
            self.adj_list.entry(u).or_default().insert(v);
            *self.degree.entry(u).or_insert(0) += 1;
        }
        if !Self::is_precolored(v) {
            self.adj_list.entry(v).or_default().insert(u);
            *self.degree.entry(v).or_insert(0) += 1;
        }
    }

    fn degree_of(&self, node: Reg) -> usize {
        if Self::is_precolored(node) {
            usize::MAX
        } else {
            self.degree.get(&node).copied().unwrap_or(0)
        }
    }

    fn virtuals(&self) -> Vec<Reg> {
        (0..self.proc.vregs).map(Reg::Virtual).collect()
    }

    fn make_worklists(&mut self) {
        for node in self.virtuals() {
            if self.degree_of(node) >= K {
                self.spill_worklist.insert(node);
            } else if self.move_related(node) {
                self.freeze_worklist.insert(node);
            } else {
                self.simplify_worklist.push(node);
            }
        }
    }

    fn node_moves(&self, node: Reg) -> Vec<usize> {
        self.move_list
            .get(&node)
            .into_iter()
            .flatten()
            .copied()
            .filter(|id| {
                matches!(
                    self.move_states[*id],
                    MoveState::Worklist | MoveState::Active
                )
            })
            .collect()
    }

    fn move_related(&self, node: Reg) -> bool {
        !self.node_moves(node).is_empty()
    }

    fn adjacent(&self, node: Reg) -> Vec<Reg> {
        self.adj_list
            .get(&node)
            .into_iter()
            .flatten()
            .copied()
            .filter(|n| !self.on_stack.contains(n) && !self.coalesced.contains(n))
            .collect()
    }

    fn simplify(&mut self, node: Reg) {
        self.select_stack.push(node);
        self.on_stack.insert(node);

        for neighbor in self.adjacent(node) {
            self.decrement_degree(neighbor);
        }
    }

    fn decrement_degree(&mut self, node: Reg) {
        if Self::is_precolored(node) {
            return;
        }

        let degree = self.degree.entry(node).or_insert(0);
        let was = *degree;
        *degree = degree.saturating_sub(1);

        if was == K {
            let mut enable: Vec<Reg> = self.adjacent(node);
            enable.push(node);
            self.enable_moves(&enable);

            self.spill_worklist.remove(&node);
            if self.move_related(node) {
                self.freeze_worklist.insert(node);
            } else {
                self.simplify_worklist.push(node);
            }
        }
    }

    fn enable_moves(&mut self, nodes: &[Reg]) {
        for node in nodes {
            for id in self.node_moves(*node) {
                if self.move_states[id] == MoveState::Active {
                    self.move_states[id] = MoveState::Worklist;
                    self.pending_moves.push_back(id);
                }
            }
        }
    }

    fn next_move(&mut self) -> Option<usize> {
        while let Some(id) = self.pending_moves.pop_front() {
            if self.move_states[id] == MoveState::Worklist {
                return Some(id);
            }
        }
        None
    }

    fn get_alias(&self, node: Reg) -> Reg {
        let mut node = node;
        while self.coalesced.contains(&node) {
            node = self.alias[&node];
        }
        node
    }

    fn coalesce(&mut self, id: usize) {
        let (dst, src) = self.moves[id];
        let x = self.get_alias(dst);
        let y = self.get_alias(src);

        // Keep any precolored endpoint as the survivor.
        let (u, v) = if Self::is_precolored(y) { (y, x) } else { (x, y) };

        if u == v {
            self.move_states[id] = MoveState::Coalesced;
            self.add_worklist(u);
        } else if Self::is_precolored(v) || self.adj_set.contains(&(u, v)) {
            self.move_states[id] = MoveState::Constrained;
            self.add_worklist(u);
            self.add_worklist(v);
        } else if self.can_coalesce(u, v) {
            self.move_states[id] = MoveState::Coalesced;
            self.combine(u, v);
            self.add_worklist(u);
        } else {
            self.move_states[id] = MoveState::Active;
        }
    }

    /// George's test against a precolored survivor, Briggs' conservative
    /// count otherwise.
    fn can_coalesce(&self, u: Reg, v: Reg) -> bool {
        if Self::is_precolored(u) {
            self.adjacent(v).into_iter().all(|t| {
                self.degree_of(t) < K
                    || Self::is_precolored(t)
                    || self.adj_set.contains(&(t, u))
            })
        } else {
            let combined: HashSet<Reg> = self
                .adjacent(u)
                .into_iter()
                .chain(self.adjacent(v))
                .collect();
            let significant = combined
                .into_iter()
                .filter(|t| self.degree_of(*t) >= K)
                .count();
            significant < K
        }
    }

    fn combine(&mut self, u: Reg, v: Reg) {
        self.freeze_worklist.remove(&v);
        self.spill_worklist.remove(&v);
        self.coalesced.insert(v);
        self.alias.insert(v, u);

        let merged = self.move_list.get(&v).cloned().unwrap_or_default();
        self.move_list.entry(u).or_default().extend(merged);
        self.enable_moves(&[v]);

        for t in self.adjacent(v) {
            self.add_edge(t, u);
            self.decrement_degree(t);
        }

        if self.degree_of(u) >= K && self.freeze_worklist.remove(&u) {
            self.spill_worklist.insert(u);
        }
    }

    fn add_worklist(&mut self, node: Reg) {
        if !Self::is_precolored(node)
            && !self.move_related(node)
            && self.degree_of(node) < K
            && self.freeze_worklist.remove(&node)
        {
            self.simplify_worklist.push(node);
        }
    }

    /// Give up on coalescing a low-degree move-related node.
    fn freeze(&mut self) {
        let node = self
            .freeze_worklist
            .iter()
            .copied()
            .sorted_by_key(|reg| (self.degree_of(*reg), reg_key(*reg)))
            .next()
            .unwrap();

        self.freeze_worklist.remove(&node);
        self.simplify_worklist.push(node);
        self.freeze_moves(node);
    }

    fn freeze_moves(&mut self, node: Reg) {
        for id in self.node_moves(node) {
            self.move_states[id] = MoveState::Frozen;

            let (dst, src) = self.moves[id];
            let other = if self.get_alias(dst) == self.get_alias(node) {
                self.get_alias(src)
            } else {
                self.get_alias(dst)
            };

            if !Self::is_precolored(other)
                && !self.move_related(other)
                && self.degree_of(other) < K
                && self.freeze_worklist.remove(&other)
            {
                self.simplify_worklist.push(other);
            }
        }
    }

    /// Spill the candidate with the worst activity-to-degree ratio,
    /// avoiding registers that were created by an earlier spill rewrite.
    fn select_spill(&mut self) {
        let node = self
            .spill_worklist
            .iter()
            .copied()
            .sorted_by(|a, b| {
                let fresh_a = self.avoid_spilling.contains(a);
                let fresh_b = self.avoid_spilling.contains(b);
                let cost_a = spill_cost(self.activity.get(a), self.degree_of(*a));
                let cost_b = spill_cost(self.activity.get(b), self.degree_of(*b));

                fresh_a
                    .cmp(&fresh_b)
                    .then(cost_a.total_cmp(&cost_b))
                    .then(reg_key(*a).cmp(&reg_key(*b)))
            })
            .next()
            .unwrap();

        trace!("spill candidate {node}");
        self.spill_worklist.remove(&node);
        self.simplify_worklist.push(node);
        self.freeze_moves(node);
    }

    /// Pop the stack and give every node a color its neighbors don't
    /// have. Optimistically pushed spill candidates that find a color are
    /// kept; the rest become actual spills.
    fn assign_colors(mut self) -> Coloring {
        let mut colors: HashMap<Reg, Phys> = HashMap::new();
        let mut spills = Vec::new();

        while let Some(node) = self.select_stack.pop() {
            self.on_stack.remove(&node);

            let mut available: Vec<Phys> = Phys::ALLOCATABLE.to_vec();
            for neighbor in self.adj_list.get(&node).into_iter().flatten() {
                let neighbor = self.get_alias(*neighbor);
                let taken = match neighbor {
                    Reg::Phys(phys) => Some(phys),
                    virt => colors.get(&virt).copied(),
                };
                if let Some(taken) = taken {
                    available.retain(|phys| *phys != taken);
                }
            }

            match available.first() {
                Some(phys) => {
                    colors.insert(node, *phys);
                }
                None => spills.push(node),
            }
        }

        for node in self.coalesced.iter().copied().sorted_by_key(|r| reg_key(*r)) {
            let target = self.get_alias(node);
            let phys = match target {
                Reg::Phys(phys) => Some(phys),
                virt => colors.get(&virt).copied(),
            };
            // A node coalesced into a spilled one spills with it.
            match phys {
                Some(phys) => {
                    colors.insert(node, phys);
                }
                None => spills.push(node),
            }
        }

        debug!(
            "{}: colored {} nodes, {} spills",
            self.proc.name,
            colors.len(),
            spills.len()
        );

        Coloring {
            colors: colors
                .into_iter()
                .filter_map(|(reg, phys)| match reg {
                    Reg::Virtual(id) => Some((id, phys)),
                    Reg::Phys(_) => None,
                })
                .collect(),
            spills,
        }
    }
}

fn spill_cost(activity: Option<&usize>, degree: usize) -> f64 {
    let activity = activity.copied().unwrap_or(0) as f64;
    activity / degree.max(1) as f64
}

/// A total order on registers, for deterministic tie-breaking.
fn reg_key(reg: Reg) -> (u8, u32) {
    match reg {
        Reg::Virtual(id) => (0, id),
        Reg::Phys(phys) => (1, phys as u32),
    }
}
