// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The call-graph-driven task pipeline.
//!
//! Workers execute per-function callbacks and push finished tasks into a
//! channel; the main thread pops them, retires dependency counters and
//! schedules newly eligible work. Bottom-up scheduling runs over the SCC
//! condensation of the call graph, so recursion cannot deadlock: a
//! component becomes eligible when its external callees are done and all
//! members are released at once. When garbage collection is on, functions
//! whose callers have all finished accumulate into a staging set that is
//! flushed to a GC task per batch.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{AnalysisError, AnalysisResult};
use crate::graph::call_graph::CallGraph;
use crate::ir::{FuncId, Module};
use crate::sched::task::{Task, TaskKind};
use crate::sched::thread_pool::ThreadPool;
use crate::util::progress::ProgressBar;

pub const DEFAULT_GC_BATCH_SIZE: usize = 100;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScheduleKind {
    /// No dependencies; every function is eligible immediately.
    Local,
    /// A function waits for its callees (modulo SCC peers).
    BottomUp,
    /// A function waits for its callers.
    TopDown,
}

#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    pub kind: ScheduleKind,
    pub enable_gc: bool,
    pub gc_batch_size: usize,
    pub task_timeout: Duration,
    pub show_progress: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            kind: ScheduleKind::BottomUp,
            enable_gc: true,
            gc_batch_size: DEFAULT_GC_BATCH_SIZE,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            show_progress: false,
        }
    }
}

pub type FunctionCallback = Arc<dyn Fn(FuncId) + Send + Sync>;

pub struct PipelineScheduler<'a> {
    module: &'a Module,
    call_graph: &'a CallGraph,
    pool: &'a ThreadPool,
    opts: SchedulerOptions,
}

impl<'a> PipelineScheduler<'a> {
    pub fn new(
        module: &'a Module,
        call_graph: &'a CallGraph,
        pool: &'a ThreadPool,
        opts: SchedulerOptions,
    ) -> Self {
        PipelineScheduler {
            module,
            call_graph,
            pool,
            opts,
        }
    }

    /// Runs `task_callback` for every defined function under the configured
    /// discipline. `gc_callback`, when present and GC is enabled, is invoked
    /// per function once all of its callers have finished.
    pub fn run(
        &self,
        task_callback: FunctionCallback,
        gc_callback: Option<FunctionCallback>,
    ) -> AnalysisResult<()> {
        let funcs: Vec<FuncId> = self
            .module
            .func_ids()
            .filter(|f| !self.module.func(*f).is_declaration)
            .collect();
        if funcs.is_empty() {
            return Ok(());
        }
        let func_set: HashSet<FuncId> = funcs.iter().copied().collect();

        // Group functions into call-graph components; a singleton component
        // is created for anything the call graph never saw.
        let (cg_sccs, _) = self.call_graph.condensation();
        let mut scc_of: HashMap<FuncId, usize> = HashMap::new();
        let mut sccs: Vec<Vec<FuncId>> = Vec::new();
        for group in &cg_sccs {
            let members: Vec<FuncId> = group
                .iter()
                .copied()
                .filter(|f| func_set.contains(f))
                .collect();
            if members.is_empty() {
                continue;
            }
            let idx = sccs.len();
            for f in &members {
                scc_of.insert(*f, idx);
            }
            sccs.push(members);
        }
        for f in &funcs {
            if !scc_of.contains_key(f) {
                let idx = sccs.len();
                scc_of.insert(*f, idx);
                sccs.push(vec![*f]);
            }
        }

        // Dependency edges between components, following the discipline.
        let num_sccs = sccs.len();
        let mut deps_remaining = vec![0usize; num_sccs];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); num_sccs];
        if self.opts.kind != ScheduleKind::Local {
            let mut edges: HashSet<(usize, usize)> = HashSet::new();
            for f in &funcs {
                for callee in self.call_graph.callees_of(*f) {
                    if !func_set.contains(&callee) {
                        continue;
                    }
                    let (sf, sc) = (scc_of[f], scc_of[&callee]);
                    if sf == sc {
                        continue;
                    }
                    // waiter depends on prerequisite
                    let (waiter, prerequisite) = match self.opts.kind {
                        ScheduleKind::BottomUp => (sf, sc),
                        ScheduleKind::TopDown => (sc, sf),
                        ScheduleKind::Local => unreachable!(),
                    };
                    if edges.insert((waiter, prerequisite)) {
                        deps_remaining[waiter] += 1;
                        dependents[prerequisite].push(waiter);
                    }
                }
            }
        }

        // Per-function caller counts drive memory reclamation.
        let gc_enabled = self.opts.enable_gc && gc_callback.is_some();
        let mut callers_remaining: HashMap<FuncId, usize> = HashMap::new();
        if gc_enabled {
            for f in &funcs {
                let callers = self
                    .call_graph
                    .callers_of(*f)
                    .into_iter()
                    .filter(|c| *c != *f && func_set.contains(c))
                    .count();
                callers_remaining.insert(*f, callers);
            }
        }

        let (tx, rx) = mpsc::channel::<Task>();
        let mut pending_members: Vec<usize> = sccs.iter().map(|m| m.len()).collect();
        let mut progress = if self.opts.show_progress {
            ProgressBar::new("[pipeline scheduler]")
        } else {
            ProgressBar::disabled("[pipeline scheduler]")
        };

        // Kick off every component without unfinished prerequisites.
        for (idx, remaining) in deps_remaining.iter().enumerate() {
            if *remaining == 0 {
                self.schedule_component(&sccs[idx], &task_callback, &tx);
            }
        }

        let total = funcs.len();
        let mut unfinished = total;
        let mut gc_inflight = 0usize;
        let mut staging: HashSet<FuncId> = HashSet::new();
        let mut finished_funcs: HashSet<FuncId> = HashSet::new();

        while unfinished > 0 || gc_inflight > 0 {
            let task = match rx.recv_timeout(self.opts.task_timeout * 2) {
                Ok(task) => task,
                Err(_) => {
                    warn!(
                        "timeout waiting for tasks: {} unfinished, {} gc in flight",
                        unfinished, gc_inflight
                    );
                    progress.finish();
                    return Err(AnalysisError::Timeout(self.opts.task_timeout * 2));
                }
            };
            match task.kind {
                TaskKind::Gc(_) => {
                    gc_inflight -= 1;
                }
                TaskKind::Custom(_) => {}
                TaskKind::Function(f) => {
                    debug!("finished {}", self.module.func(f).name);
                    unfinished -= 1;
                    finished_funcs.insert(f);
                    progress.show_progress((total - unfinished) as f32 / total as f32);

                    let component = scc_of[&f];
                    pending_members[component] -= 1;
                    if pending_members[component] == 0 {
                        for waiter in &dependents[component] {
                            deps_remaining[*waiter] -= 1;
                            if deps_remaining[*waiter] == 0 {
                                self.schedule_component(&sccs[*waiter], &task_callback, &tx);
                            }
                        }
                    }

                    if gc_enabled {
                        if callers_remaining.get(&f) == Some(&0) {
                            staging.insert(f);
                        }
                        for callee in self.call_graph.callees_of(f) {
                            if callee == f || !func_set.contains(&callee) {
                                continue;
                            }
                            let remaining = callers_remaining.get_mut(&callee).unwrap();
                            if *remaining > 0 {
                                *remaining -= 1;
                                if *remaining == 0 && finished_funcs.contains(&callee) {
                                    staging.insert(callee);
                                }
                            }
                        }
                        if staging.len() >= self.opts.gc_batch_size {
                            let batch: Vec<FuncId> = staging.drain().collect();
                            self.schedule_gc(batch, gc_callback.as_ref().unwrap(), &tx);
                            gc_inflight += 1;
                        }
                    }
                }
            }
        }

        // Flush the leftover staging set in one final batch.
        if gc_enabled && !staging.is_empty() {
            let batch: Vec<FuncId> = staging.drain().collect();
            self.schedule_gc(batch, gc_callback.as_ref().unwrap(), &tx);
            match rx.recv_timeout(self.opts.task_timeout * 2) {
                Ok(_) => {}
                Err(_) => warn!("timeout waiting for the final gc batch"),
            }
        }

        progress.finish();
        self.pool.wait();
        Ok(())
    }

    fn schedule_component(
        &self,
        members: &[FuncId],
        callback: &FunctionCallback,
        tx: &mpsc::Sender<Task>,
    ) {
        for f in members {
            let f = *f;
            let callback = callback.clone();
            let tx = tx.clone();
            self.pool.enqueue(move || {
                // A panicking callback still counts as completion; liveness
                // beats partial results here.
                let _ = catch_unwind(AssertUnwindSafe(|| callback(f)));
                let _ = tx.send(Task::function(f));
            });
        }
    }

    fn schedule_gc(&self, batch: Vec<FuncId>, callback: &FunctionCallback, tx: &mpsc::Sender<Task>) {
        let callback = callback.clone();
        let tx = tx.clone();
        self.pool.enqueue(move || {
            for f in &batch {
                let _ = catch_unwind(AssertUnwindSafe(|| callback(*f)));
            }
            let _ = tx.send(Task::gc(batch));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::call_graph::build_call_graph;
    use crate::ir::TypeInfo;
    use crate::util::stats::AnalysisStats;
    use std::sync::Mutex;

    /// main -> a -> b, main -> c -> b, b -> a (recursion).
    fn diamond_module() -> (Module, [FuncId; 4]) {
        let mut m = Module::new("t");
        let a = m.define_function("a", &[], TypeInfo::void());
        let b_f = m.define_function("b", &[], TypeInfo::void());
        let c = m.define_function("c", &[], TypeInfo::void());
        let main = m.define_function("main", &[], TypeInfo::void());

        let mut fb = m.build_function(a);
        let bb = fb.block();
        fb.call(bb, b_f, &[], TypeInfo::void());
        fb.ret(bb, None);

        let mut fb = m.build_function(b_f);
        let bb = fb.block();
        fb.call(bb, a, &[], TypeInfo::void());
        fb.ret(bb, None);

        let mut fb = m.build_function(c);
        let bb = fb.block();
        fb.call(bb, b_f, &[], TypeInfo::void());
        fb.ret(bb, None);

        let mut fb = m.build_function(main);
        let bb = fb.block();
        fb.call(bb, a, &[], TypeInfo::void());
        fb.call(bb, c, &[], TypeInfo::void());
        fb.ret(bb, None);

        (m, [a, b_f, c, main])
    }

    fn run_scheduler(
        module: &Module,
        kind: ScheduleKind,
        workers: usize,
    ) -> (Vec<FuncId>, Vec<FuncId>) {
        let stats = AnalysisStats::new();
        let cg = build_call_graph(module, &stats);
        let pool = ThreadPool::new(workers);
        let opts = SchedulerOptions {
            kind,
            gc_batch_size: 2,
            ..Default::default()
        };
        let scheduler = PipelineScheduler::new(module, &cg, &pool, opts);

        let order: Arc<Mutex<Vec<FuncId>>> = Arc::new(Mutex::new(Vec::new()));
        let released: Arc<Mutex<Vec<FuncId>>> = Arc::new(Mutex::new(Vec::new()));
        let order_cb = order.clone();
        let released_cb = released.clone();
        scheduler
            .run(
                Arc::new(move |f| {
                    order_cb.lock().unwrap().push(f);
                }),
                Some(Arc::new(move |f| {
                    released_cb.lock().unwrap().push(f);
                })),
            )
            .unwrap();

        let order = order.lock().unwrap().clone();
        let released = released.lock().unwrap().clone();
        (order, released)
    }

    #[test]
    fn bottom_up_respects_dependencies() {
        let (module, [a, b_f, c, main]) = diamond_module();
        let (order, released) = run_scheduler(&module, ScheduleKind::BottomUp, 2);
        assert_eq!(order.len(), 4);
        let pos = |f: FuncId| order.iter().position(|x| *x == f).unwrap();
        // The recursive pair {a, b} comes first in some order, then c,
        // then main.
        assert!(pos(a) < pos(c) || pos(b_f) < pos(c));
        assert!(pos(c) < pos(main) || pos(a) < pos(main));
        assert_eq!(pos(main), 3);
        // Everything is eventually released.
        let mut released_sorted = released.clone();
        released_sorted.sort();
        let mut all = vec![a, b_f, c, main];
        all.sort();
        assert_eq!(released_sorted, all);
    }

    #[test]
    fn local_mode_runs_everything() {
        let (module, funcs) = diamond_module();
        let (order, _) = run_scheduler(&module, ScheduleKind::Local, 3);
        assert_eq!(order.len(), funcs.len());
    }

    #[test]
    fn top_down_mirrors_bottom_up() {
        let (module, [a, _b, c, main]) = diamond_module();
        let (order, _) = run_scheduler(&module, ScheduleKind::TopDown, 2);
        let pos = |f: FuncId| order.iter().position(|x| *x == f).unwrap();
        assert_eq!(pos(main), 0);
        assert!(pos(main) < pos(c));
        assert!(pos(main) < pos(a));
    }

    #[test]
    fn empty_module_completes_immediately() {
        let m = Module::new("empty");
        let stats = AnalysisStats::new();
        let cg = build_call_graph(&m, &stats);
        let pool = ThreadPool::new(1);
        let scheduler =
            PipelineScheduler::new(&m, &cg, &pool, SchedulerOptions::default());
        scheduler.run(Arc::new(|_| {}), None).unwrap();
    }

    #[test]
    fn single_recursive_function_does_not_deadlock() {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut fb = m.build_function(f);
        let bb = fb.block();
        fb.call(bb, f, &[], TypeInfo::void());
        fb.ret(bb, None);

        let (order, _) = run_scheduler(&m, ScheduleKind::BottomUp, 1);
        assert_eq!(order, vec![f]);
    }

    #[test]
    fn panicking_callback_counts_as_completion() {
        let (module, _) = diamond_module();
        let stats = AnalysisStats::new();
        let cg = build_call_graph(&module, &stats);
        let pool = ThreadPool::new(2);
        let scheduler = PipelineScheduler::new(
            &module,
            &cg,
            &pool,
            SchedulerOptions {
                enable_gc: false,
                ..Default::default()
            },
        );
        scheduler
            .run(Arc::new(|_| panic!("checker bug")), None)
            .unwrap();
    }
}
