//! Per-function control-flow and liveness analysis.
//!
//! The analyzer runs once per function, before any code is emitted, and
//! produces three things:
//!
//! * a *block layout*: an order in which every loop's blocks form a
//!   contiguous range with the loop header first, child loops placed as a
//!   unit at the position of their header, and same-level blocks kept in
//!   the adaptor's natural order;
//! * a compact *loop tree* over that layout;
//! * per-value *liveness*: first/last layout index, a use count, and a
//!   "lives around a back-edge" flag that drives delayed freeing.
//!
//! There is no dataflow iteration: one pass to discover loops and lay out
//! blocks, one pass over all operands to count uses and extend intervals.
//!
//! Loop discovery treats the earliest-reached header of an irreducible
//! region as the loop head; later back-edges into other blocks of the
//! region become plain back-edges. See `irreducible_cfg` below, which pins
//! this behavior.

use crate::adaptor::IrAdaptor;
use crate::{BlockIdx, LoopIdx, ValLocalIdx};
use cranelift_entity::packed_option::{PackedOption, ReservedValue};
use cranelift_entity::{EntityRef, PrimaryMap};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Liveness interval of one value, in layout-order block indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Liveness {
    pub first: BlockIdx,
    pub last: BlockIdx,
    /// Total number of references the compiled code will take: one per
    /// operand occurrence, one per PHI incoming edge, plus one for the
    /// definition of non-PHI values.
    pub ref_count: u32,
    /// The value is live around a loop back-edge; its release must be
    /// deferred to the end of block `last`.
    pub last_full: bool,
}

impl Liveness {
    fn untouched() -> Self {
        Liveness {
            first: BlockIdx::reserved_value(),
            last: BlockIdx::reserved_value(),
            ref_count: 0,
            last_full: false,
        }
    }
}

/// One loop in the loop tree. `first..=last` is the contiguous layout range
/// of the loop body; `first` is the header.
#[derive(Clone, Debug)]
pub struct LoopInfo {
    pub parent: PackedOption<LoopIdx>,
    pub level: u32,
    pub first: BlockIdx,
    pub last: BlockIdx,
    /// Number of values defined in descendant loops that outlive their
    /// defining loop; used to keep headroom when handing out fixed
    /// register assignments.
    pub definitions_in_childs: u32,
}

pub struct Analyzer<A: IrAdaptor> {
    layout: Vec<A::Block>,
    block_map: FxHashMap<A::Block, BlockIdx>,
    multiple_incoming: Vec<bool>,
    has_phis: Vec<bool>,
    block_loop: Vec<LoopIdx>,
    loops: PrimaryMap<LoopIdx, LoopInfo>,
    liveness: Vec<Liveness>,
}

impl<A: IrAdaptor> Analyzer<A> {
    pub fn new() -> Self {
        Analyzer {
            layout: Vec::new(),
            block_map: FxHashMap::default(),
            multiple_incoming: Vec::new(),
            has_phis: Vec::new(),
            block_loop: Vec::new(),
            loops: PrimaryMap::new(),
            liveness: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.layout.clear();
        self.block_map.clear();
        self.multiple_incoming.clear();
        self.has_phis.clear();
        self.block_loop.clear();
        self.loops.clear();
        self.liveness.clear();
    }

    pub fn num_blocks(&self) -> usize {
        self.layout.len()
    }

    pub fn block_layout(&self) -> &[A::Block] {
        &self.layout
    }

    pub fn block_idx(&self, block: A::Block) -> BlockIdx {
        self.block_map[&block]
    }

    pub fn block_ref(&self, idx: BlockIdx) -> A::Block {
        self.layout[idx.index()]
    }

    pub fn block_has_multiple_incoming(&self, idx: BlockIdx) -> bool {
        self.multiple_incoming[idx.index()]
    }

    pub fn block_has_phis(&self, idx: BlockIdx) -> bool {
        self.has_phis[idx.index()]
    }

    pub fn block_loop_idx(&self, idx: BlockIdx) -> LoopIdx {
        self.block_loop[idx.index()]
    }

    pub fn loop_info(&self, idx: LoopIdx) -> &LoopInfo {
        &self.loops[idx]
    }

    pub fn liveness(&self, val: ValLocalIdx) -> &Liveness {
        &self.liveness[val.index()]
    }

    pub fn liveness_count(&self) -> usize {
        self.liveness.len()
    }

    /// Analyze the adaptor's current function.
    pub fn switch_func(&mut self, adaptor: &A) {
        self.reset();

        // Number blocks in adaptor order and build the CFG scaffolding.
        let order: Vec<A::Block> = adaptor.cur_blocks().collect();
        let n = order.len();
        let mut tmp_idx: FxHashMap<A::Block, u32> = FxHashMap::default();
        for (i, &b) in order.iter().enumerate() {
            tmp_idx.insert(b, i as u32);
        }

        let mut succs: Vec<SmallVec<[u32; 2]>> = vec![SmallVec::new(); n];
        let mut preds: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); n];
        for (i, &b) in order.iter().enumerate() {
            for s in adaptor.block_succs(b) {
                let si = tmp_idx[&s];
                succs[i].push(si);
                preds[si as usize].push(i as u32);
            }
        }

        let back_edges = Self::find_back_edges(&succs);
        let loop_bodies = Self::collect_loop_bodies(&back_edges, &preds, n);
        let innermost = Self::assign_innermost(&loop_bodies, n);
        self.build_layout(&order, &loop_bodies, &innermost, n);
        self.finish_loop_tree(&loop_bodies, &innermost, &order, n);

        self.multiple_incoming = self
            .layout
            .iter()
            .map(|b| preds[tmp_idx[b] as usize].len() > 1)
            .collect();
        self.has_phis = self
            .layout
            .iter()
            .map(|&b| adaptor.block_phis(b).next().is_some())
            .collect();

        self.compute_liveness(adaptor);
        self.extend_loop_lifetimes();
    }

    /// DFS with in-progress marks; an edge to a block still on the DFS
    /// stack is a back-edge and its target a loop header. Returns the
    /// back-edges as `(source, header)` pairs in temporary indices.
    fn find_back_edges(succs: &[SmallVec<[u32; 2]>]) -> Vec<(u32, u32)> {
        let n = succs.len();
        let mut edges = Vec::new();
        if n == 0 {
            return edges;
        }
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unseen,
            OnStack,
            Done,
        }
        let mut marks = vec![Mark::Unseen; n];
        // (block, next successor position)
        let mut stack: Vec<(u32, u32)> = vec![(0, 0)];
        marks[0] = Mark::OnStack;
        while let Some(&mut (b, ref mut pos)) = stack.last_mut() {
            if (*pos as usize) < succs[b as usize].len() {
                let s = succs[b as usize][*pos as usize];
                *pos += 1;
                match marks[s as usize] {
                    Mark::OnStack => edges.push((b, s)),
                    Mark::Unseen => {
                        marks[s as usize] = Mark::OnStack;
                        stack.push((s, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[b as usize] = Mark::Done;
                stack.pop();
            }
        }
        edges
    }

    /// Natural-loop body collection: walk predecessors backwards from every
    /// back-edge source until the header is reached. Back-edges that share
    /// a header merge into one loop. Returns loops sorted by body size,
    /// smallest first, each as `(header, body-bitset)`.
    fn collect_loop_bodies(
        back_edges: &[(u32, u32)],
        preds: &[SmallVec<[u32; 4]>],
        n: usize,
    ) -> Vec<(u32, Vec<bool>)> {
        let mut loops: Vec<(u32, Vec<bool>)> = Vec::new();
        let mut headers: Vec<u32> = back_edges.iter().map(|&(_, h)| h).collect();
        headers.sort_unstable();
        headers.dedup();
        for &h in &headers {
            let mut body = vec![false; n];
            body[h as usize] = true;
            let mut work: Vec<u32> = back_edges
                .iter()
                .filter(|&&(_, eh)| eh == h)
                .map(|&(src, _)| src)
                .collect();
            while let Some(b) = work.pop() {
                if body[b as usize] {
                    continue;
                }
                // The entry block stays at layout index zero; in
                // irreducible regions the backwards walk could otherwise
                // absorb it as a plain member.
                if b == 0 && h != 0 {
                    continue;
                }
                body[b as usize] = true;
                for &p in &preds[b as usize] {
                    if !body[p as usize] {
                        work.push(p);
                    }
                }
            }
            loops.push((h, body));
        }
        loops.sort_by_key(|(h, body)| (body.iter().filter(|&&x| x).count(), *h));
        loops
    }

    /// Innermost loop (index into `loop_bodies`) per block, if any.
    fn assign_innermost(loop_bodies: &[(u32, Vec<bool>)], n: usize) -> Vec<Option<u32>> {
        let mut innermost = vec![None; n];
        for b in 0..n {
            for (li, (_, body)) in loop_bodies.iter().enumerate() {
                if body[b] {
                    innermost[b] = Some(li as u32);
                    break;
                }
            }
        }
        innermost
    }

    /// Emit the layout: same-level blocks in adaptor order, every loop as a
    /// contiguous unit starting at its header.
    fn build_layout(
        &mut self,
        order: &[A::Block],
        loop_bodies: &[(u32, Vec<bool>)],
        innermost: &[Option<u32>],
        n: usize,
    ) {
        // parent candidate chain: for a block in nested loops, walk from its
        // innermost loop outwards to find the child of the current level.
        let parent_of = |li: u32| -> Option<u32> {
            let (h, _) = loop_bodies[li as usize];
            for (pi, (ph, pbody)) in loop_bodies.iter().enumerate().skip(li as usize + 1) {
                if *ph != h && pbody[h as usize] {
                    return Some(pi as u32);
                }
            }
            None
        };

        let mut emitted_block = vec![false; n];
        let mut emitted_loop = vec![false; loop_bodies.len()];

        // Emit `li`'s body (header first), recursing into child loops at the
        // position of their header.
        fn emit_loop<A: IrAdaptor>(
            az: &mut Analyzer<A>,
            li: u32,
            order: &[A::Block],
            loop_bodies: &[(u32, Vec<bool>)],
            innermost: &[Option<u32>],
            parent_of: &dyn Fn(u32) -> Option<u32>,
            emitted_block: &mut [bool],
            emitted_loop: &mut [bool],
        ) {
            if emitted_loop[li as usize] {
                return;
            }
            emitted_loop[li as usize] = true;
            let (h, body) = &loop_bodies[li as usize];
            push_block(az, order, *h as usize, emitted_block);
            for b in 0..order.len() {
                if !body[b] || emitted_block[b] {
                    continue;
                }
                let inner = innermost[b].expect("body block without a loop");
                if inner == li {
                    push_block(az, order, b, emitted_block);
                } else {
                    // Find the child of `li` that contains b.
                    let mut child = inner;
                    while parent_of(child) != Some(li) {
                        child = match parent_of(child) {
                            Some(p) => p,
                            None => break,
                        };
                    }
                    emit_loop(
                        az,
                        child,
                        order,
                        loop_bodies,
                        innermost,
                        parent_of,
                        emitted_block,
                        emitted_loop,
                    );
                }
            }
        }

        fn push_block<A: IrAdaptor>(
            az: &mut Analyzer<A>,
            order: &[A::Block],
            b: usize,
            emitted_block: &mut [bool],
        ) {
            if emitted_block[b] {
                return;
            }
            emitted_block[b] = true;
            let idx = BlockIdx::new(az.layout.len());
            az.layout.push(order[b]);
            az.block_map.insert(order[b], idx);
        }

        for b in 0..n {
            if emitted_block[b] {
                continue;
            }
            match innermost[b] {
                None => push_block(self, order, b, &mut emitted_block),
                Some(inner) => {
                    // Outermost loop containing b.
                    let mut li = inner;
                    while let Some(p) = parent_of(li) {
                        li = p;
                    }
                    emit_loop(
                        self,
                        li,
                        order,
                        loop_bodies,
                        innermost,
                        &parent_of,
                        &mut emitted_block,
                        &mut emitted_loop,
                    );
                }
            }
        }
        debug_assert_eq!(self.layout.len(), n);
    }

    /// Build the final loop tree over layout indices. Loop 0 is the
    /// function-wide pseudo-loop.
    fn finish_loop_tree(
        &mut self,
        loop_bodies: &[(u32, Vec<bool>)],
        innermost: &[Option<u32>],
        order: &[A::Block],
        n: usize,
    ) {
        let root = self.loops.push(LoopInfo {
            parent: None.into(),
            level: 0,
            first: BlockIdx::new(0),
            last: BlockIdx::new(n.saturating_sub(1)),
            definitions_in_childs: 0,
        });
        self.block_loop = vec![root; n];
        if n == 0 {
            return;
        }

        // Map temporary loop index -> LoopIdx; process outermost first so
        // parents exist before children.
        let mut by_size: Vec<usize> = (0..loop_bodies.len()).collect();
        by_size.sort_by_key(|&i| {
            core::cmp::Reverse(loop_bodies[i].1.iter().filter(|&&x| x).count())
        });
        let mut loop_map: Vec<PackedOption<LoopIdx>> =
            vec![None.into(); loop_bodies.len()];
        for &ti in &by_size {
            let (h, body) = &loop_bodies[ti];
            // Smallest strictly-larger loop containing our header.
            let mut parent = root;
            let mut parent_size = usize::MAX;
            for (oi, (oh, obody)) in loop_bodies.iter().enumerate() {
                if oi == ti || *oh == *h {
                    continue;
                }
                let osize = obody.iter().filter(|&&x| x).count();
                if obody[*h as usize] && osize < parent_size {
                    if let Some(ol) = loop_map[oi].expand() {
                        parent = ol;
                        parent_size = osize;
                    }
                }
            }
            let mut first = BlockIdx::reserved_value();
            let mut last = BlockIdx::new(0);
            for b in 0..n {
                if body[b] {
                    let li = self.block_map[&order[b]];
                    if first == BlockIdx::reserved_value() || li < first {
                        first = li;
                    }
                    if li > last {
                        last = li;
                    }
                }
            }
            let level = self.loops[parent].level + 1;
            let idx = self.loops.push(LoopInfo {
                parent: parent.into(),
                level,
                first,
                last,
                definitions_in_childs: 0,
            });
            loop_map[ti] = idx.into();
        }

        for b in 0..n {
            if let Some(inner) = innermost[b] {
                let li = self.block_map[&order[b]];
                self.block_loop[li.index()] = loop_map[inner as usize].expand().unwrap();
            }
        }
    }

    fn compute_liveness(&mut self, adaptor: &A) {
        self.liveness = vec![Liveness::untouched(); adaptor.cur_val_count() as usize];

        let touch = |lv: &mut Vec<Liveness>, val: ValLocalIdx, at: BlockIdx| {
            let l = &mut lv[val.index()];
            if l.ref_count == 0 {
                l.first = at;
                l.last = at;
            } else {
                if at < l.first {
                    l.first = at;
                }
                if at > l.last {
                    l.last = at;
                }
            }
            l.ref_count += 1;
        };

        // Arguments are born in the entry block.
        if !self.layout.is_empty() {
            let entry = BlockIdx::new(0);
            for arg in adaptor.cur_args() {
                if !adaptor.val_ignore_in_liveness(arg) {
                    touch(&mut self.liveness, adaptor.val_local_idx(arg), entry);
                }
            }
        }

        for bi in 0..self.layout.len() {
            let at = BlockIdx::new(bi);
            let block = self.layout[bi];

            // A PHI is referenced once per incoming edge (the move happens
            // at the predecessor's terminator), and its incoming values are
            // used in the predecessor, not here. The PHI has no separate
            // definition reference: nothing is compiled at its own block.
            for phi in adaptor.block_phis(block) {
                let phi_idx = adaptor.val_local_idx(phi);
                for slot in 0..adaptor.phi_incoming_count(phi) {
                    let (pred, val) = adaptor.phi_incoming(phi, slot);
                    if val == phi {
                        // Self-references resolve to nothing at the edge.
                        continue;
                    }
                    let pred_at = self.block_map[&pred];
                    touch(&mut self.liveness, phi_idx, pred_at);
                    if !adaptor.val_ignore_in_liveness(val) {
                        touch(&mut self.liveness, adaptor.val_local_idx(val), pred_at);
                    }
                }
            }

            for inst in adaptor.block_insts(block) {
                for op in adaptor.inst_operands(inst) {
                    if !adaptor.val_ignore_in_liveness(op) {
                        touch(&mut self.liveness, adaptor.val_local_idx(op), at);
                    }
                }
                for res in adaptor.inst_results(inst) {
                    touch(&mut self.liveness, adaptor.val_local_idx(res), at);
                }
            }
        }
    }

    /// Extend intervals of values that are live around a back-edge to the
    /// end of the loop, and flag them `last_full`.
    fn extend_loop_lifetimes(&mut self) {
        let nvals = self.liveness.len();
        for v in 0..nvals {
            let (first, last, ref_count) = {
                let l = &self.liveness[v];
                (l.first, l.last, l.ref_count)
            };
            if ref_count == 0 {
                continue;
            }

            let def_loop = self.block_loop[first.index()];
            let mut lp = self.block_loop[last.index()];
            let mut extended = false;
            while self.loops[lp].parent.is_some() {
                if first < self.loops[lp].first {
                    let l = &mut self.liveness[v];
                    if self.loops[lp].last > l.last {
                        l.last = self.loops[lp].last;
                    }
                    l.last_full = true;
                    extended = true;
                    lp = self.loops[lp].parent.expand().unwrap();
                } else {
                    break;
                }
            }

            // A value escaping its defining loop competes with fixed
            // assignments of every enclosing loop it is carried through.
            if extended || last > self.loops[def_loop].last {
                let mut a = def_loop;
                while let Some(p) = self.loops[a].parent.expand() {
                    self.loops[p].definitions_in_childs += 1;
                    a = p;
                }
            }
        }
    }
}

impl<A: IrAdaptor> Default for Analyzer<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::Linkage;

    /// Minimal adaptor over an explicit block graph; values are (def-block,
    /// use-blocks) pairs so liveness can be exercised without instructions.
    struct Graph {
        succs: Vec<Vec<u32>>,
        /// (def_block, use_blocks) per value.
        vals: Vec<(u32, Vec<u32>)>,
    }

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    struct B(u32);
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    struct V(u32);
    /// One pseudo-instruction per value: defines it in its def block.
    #[derive(Clone, Copy, Debug)]
    struct I(u32, bool); // (value, is_use)

    impl IrAdaptor for Graph {
        type Value = V;
        type Inst = I;
        type Block = B;
        type Func = u32;

        fn func_count(&self) -> u32 {
            1
        }
        fn funcs(&self) -> impl Iterator<Item = u32> + '_ {
            core::iter::once(0)
        }
        fn func_link_name(&self, _: u32) -> &str {
            "f"
        }
        fn func_extern(&self, _: u32) -> bool {
            false
        }
        fn func_linkage(&self, _: u32) -> Linkage {
            Linkage::Export
        }
        fn switch_func(&mut self, _: u32) -> bool {
            true
        }
        fn reset(&mut self) {}
        fn cur_val_count(&self) -> u32 {
            self.vals.len() as u32
        }
        fn cur_is_vararg(&self) -> bool {
            false
        }
        fn cur_args(&self) -> impl Iterator<Item = V> + '_ {
            core::iter::empty()
        }
        fn cur_arg_is_byval(&self, _: u32) -> bool {
            false
        }
        fn cur_arg_byval_size(&self, _: u32) -> u32 {
            0
        }
        fn cur_arg_byval_align(&self, _: u32) -> u32 {
            0
        }
        fn cur_arg_is_sret(&self, _: u32) -> bool {
            false
        }
        fn cur_static_allocas(&self) -> impl Iterator<Item = V> + '_ {
            core::iter::empty()
        }
        fn cur_has_dynamic_alloca(&self) -> bool {
            false
        }
        fn cur_entry_block(&self) -> B {
            B(0)
        }
        fn cur_blocks(&self) -> impl Iterator<Item = B> + '_ {
            (0..self.succs.len() as u32).map(B)
        }
        fn block_succs(&self, b: B) -> impl Iterator<Item = B> + '_ {
            self.succs[b.0 as usize].iter().map(|&s| B(s))
        }
        fn block_insts(&self, b: B) -> impl Iterator<Item = I> + '_ {
            let defs = self
                .vals
                .iter()
                .enumerate()
                .filter(move |(_, (d, _))| *d == b.0)
                .map(|(i, _)| I(i as u32, false));
            let uses: Vec<I> = self
                .vals
                .iter()
                .enumerate()
                .flat_map(|(i, (_, us))| {
                    us.iter()
                        .filter(move |&&u| u == b.0)
                        .map(move |_| I(i as u32, true))
                })
                .collect();
            defs.chain(uses.into_iter())
        }
        fn block_phis(&self, _: B) -> impl Iterator<Item = V> + '_ {
            core::iter::empty()
        }
        fn val_local_idx(&self, v: V) -> ValLocalIdx {
            ValLocalIdx::new(v.0 as usize)
        }
        fn val_ignore_in_liveness(&self, _: V) -> bool {
            false
        }
        fn val_is_phi(&self, _: V) -> bool {
            false
        }
        fn phi_incoming_count(&self, _: V) -> u32 {
            0
        }
        fn phi_incoming(&self, _: V, _: u32) -> (B, V) {
            unreachable!()
        }
        fn phi_incoming_for_block(&self, _: V, _: B) -> V {
            unreachable!()
        }
        fn val_alloca_size(&self, _: V) -> u32 {
            0
        }
        fn val_alloca_align(&self, _: V) -> u32 {
            0
        }
        fn inst_operands(&self, i: I) -> impl Iterator<Item = V> + '_ {
            i.1.then_some(V(i.0)).into_iter()
        }
        fn inst_results(&self, i: I) -> impl Iterator<Item = V> + '_ {
            (!i.1).then_some(V(i.0)).into_iter()
        }
        fn inst_fused(&self, _: I) -> bool {
            false
        }
    }

    fn layout_of(g: &Graph) -> Vec<u32> {
        let mut az = Analyzer::new();
        az.switch_func(g);
        az.block_layout().iter().map(|b| b.0).collect()
    }

    #[test]
    fn straight_line_keeps_order() {
        let g = Graph {
            succs: vec![vec![1], vec![2], vec![]],
            vals: vec![],
        };
        assert_eq!(layout_of(&g), vec![0, 1, 2]);
    }

    #[test]
    fn diamond_keeps_adaptor_order() {
        let g = Graph {
            succs: vec![vec![1, 2], vec![3], vec![3], vec![]],
            vals: vec![],
        };
        let mut az = Analyzer::new();
        az.switch_func(&g);
        assert_eq!(layout_of(&g), vec![0, 1, 2, 3]);
        assert!(az.block_has_multiple_incoming(BlockIdx::new(3)));
        assert!(!az.block_has_multiple_incoming(BlockIdx::new(1)));
    }

    #[test]
    fn loop_body_is_contiguous() {
        // 0 -> 1(header) -> 2 -> 3 -> 1, 2 -> 4(exit); adaptor order puts
        // the exit before 3 so a naive order would split the loop.
        let g = Graph {
            succs: vec![vec![1], vec![2], vec![4, 3], vec![1], vec![]],
            vals: vec![],
        };
        let l = layout_of(&g);
        assert_eq!(l, vec![0, 1, 2, 3, 4]);
        let mut az = Analyzer::new();
        az.switch_func(&g);
        let hdr = az.block_loop_idx(az.block_idx(B(1)));
        let info = az.loop_info(hdr);
        assert_eq!(info.level, 1);
        assert_eq!(info.first, az.block_idx(B(1)));
        assert_eq!(info.last, az.block_idx(B(3)));
    }

    #[test]
    fn nested_loops_form_units() {
        // outer: 1..4, inner: 2..3.
        let g = Graph {
            succs: vec![
                vec![1],
                vec![2],
                vec![3],
                vec![2, 4],
                vec![1, 5],
                vec![],
            ],
            vals: vec![],
        };
        let l = layout_of(&g);
        assert_eq!(l, vec![0, 1, 2, 3, 4, 5]);
        let mut az = Analyzer::new();
        az.switch_func(&g);
        let inner = az.block_loop_idx(az.block_idx(B(2)));
        let outer = az.block_loop_idx(az.block_idx(B(1)));
        assert_eq!(az.loop_info(inner).level, 2);
        assert_eq!(az.loop_info(outer).level, 1);
        assert_eq!(az.loop_info(inner).parent.expand(), Some(outer));
    }

    #[test]
    fn irreducible_cfg() {
        // 0 branches to both 1 and 2, and 1 <-> 2 form a cycle entered at
        // two points. The DFS reaches 1 first, so 1 becomes the header.
        let g = Graph {
            succs: vec![vec![1, 2], vec![2], vec![1, 3], vec![]],
            vals: vec![],
        };
        let l = layout_of(&g);
        assert_eq!(l, vec![0, 1, 2, 3]);
        let mut az = Analyzer::new();
        az.switch_func(&g);
        let lp = az.block_loop_idx(az.block_idx(B(1)));
        assert_eq!(az.loop_info(lp).first, az.block_idx(B(1)));
    }

    #[test]
    fn liveness_counts_and_intervals() {
        // v0 defined in 0, used in 1 and 2.
        let g = Graph {
            succs: vec![vec![1], vec![2], vec![]],
            vals: vec![(0, vec![1, 2])],
        };
        let mut az = Analyzer::new();
        az.switch_func(&g);
        let l = az.liveness(ValLocalIdx::new(0));
        assert_eq!(l.ref_count, 3); // def + 2 uses
        assert_eq!(l.first, BlockIdx::new(0));
        assert_eq!(l.last, BlockIdx::new(2));
        assert!(!l.last_full);
    }

    #[test]
    fn loop_use_extends_to_loop_end() {
        // 0 -> 1(header) -> 2 -> 1 back edge, 2 -> 3 exit.
        // v0 defined in 0, used only in 1: it is live around the back edge
        // and must survive until the loop's last block.
        let g = Graph {
            succs: vec![vec![1], vec![2], vec![1, 3], vec![]],
            vals: vec![(0, vec![1])],
        };
        let mut az = Analyzer::new();
        az.switch_func(&g);
        let l = az.liveness(ValLocalIdx::new(0));
        assert!(l.last_full);
        assert_eq!(l.last, az.block_idx(B(2)));
    }

    #[test]
    fn value_local_to_one_iteration_is_not_extended() {
        let g = Graph {
            succs: vec![vec![1], vec![2], vec![1, 3], vec![]],
            vals: vec![(1, vec![2])],
        };
        let mut az = Analyzer::new();
        az.switch_func(&g);
        let l = az.liveness(ValLocalIdx::new(0));
        assert!(!l.last_full);
    }

    #[test]
    fn analyzer_is_idempotent() {
        let g = Graph {
            succs: vec![
                vec![1],
                vec![2],
                vec![3],
                vec![2, 4],
                vec![1, 5],
                vec![],
            ],
            vals: vec![(0, vec![4]), (2, vec![3]), (1, vec![4, 5])],
        };
        let mut az1 = Analyzer::new();
        az1.switch_func(&g);
        let mut az2 = Analyzer::new();
        az2.switch_func(&g);
        assert_eq!(az1.block_layout(), az2.block_layout());
        for v in 0..3 {
            assert_eq!(
                az1.liveness(ValLocalIdx::new(v)),
                az2.liveness(ValLocalIdx::new(v))
            );
        }

        // And re-running on the same analyzer matches too.
        let layout: Vec<_> = az1.block_layout().to_vec();
        az1.switch_func(&g);
        assert_eq!(az1.block_layout(), &layout[..]);
    }
}
