//! End-to-end scenario tests: overlap chains, cycle rejection, patchgroup
//! ordering, cache back-pressure. A couple of simpler scenarios live inline
//! in `src/lib.rs` since they need no more than a bare `Engine`; these need
//! a full stack.

use featherstitch::{
    BdHandle, BdId, BlockDevice, Engine, FeatherstitchError, FlushRequest, FlushResult, RawDiskBd,
};

#[test]
fn overlap_chain_blocks_the_newest_patch_until_its_neighbor_lands() {
    let mut engine = Engine::new(true);
    let owner = BdHandle { id: BdId::fresh(), level: 0, graph_index: 0 };
    let block = engine.alloc_synthetic(1, 16);

    let p1 = engine.create_byte(block, owner, 0, 4, Some(&[1, 1, 1, 1]), &[]).unwrap();
    let p2 = engine.create_byte(block, owner, 2, 4, Some(&[2, 2, 2, 2]), &[]).unwrap();
    let p3 = engine.create_byte(block, owner, 4, 4, Some(&[3, 3, 3, 3]), &[]).unwrap();

    assert_eq!(engine.patch(p2).befores.iter().copied().collect::<Vec<_>>(), vec![p1]);
    assert_eq!(engine.patch(p3).befores.iter().copied().collect::<Vec<_>>(), vec![p2]);
    assert!(!engine.patch(p3).is_ready());

    engine.satisfy(p1).unwrap();
    engine.satisfy(p2).unwrap();
    assert!(engine.patch(p3).is_ready());
}

#[test]
fn add_depend_rejects_a_cycle_and_leaves_the_graph_untouched() {
    let mut engine = Engine::new(true);
    let owner = BdHandle { id: BdId::fresh(), level: 0, graph_index: 0 };
    let block = engine.alloc_synthetic(1, 16);

    let a = engine.create_byte(block, owner, 0, 4, Some(&[0; 4]), &[]).unwrap();
    let b = engine.create_byte(block, owner, 4, 4, Some(&[0; 4]), &[a]).unwrap();

    let result = engine.add_depend(a, b);
    assert!(matches!(result, Err(FeatherstitchError::CycleDetected)));

    assert!(!engine.patch(a).befores.contains(&b), "cycle-rejected edge must not be installed");
    assert!(engine.patch(b).befores.contains(&a), "the original edge must survive untouched");

    assert!(!engine.patch(a).flags.contains(featherstitch::PatchFlags::MARKED));
    assert!(!engine.patch(b).flags.contains(featherstitch::PatchFlags::MARKED));
}

#[test]
fn patchgroup_ordering_makes_one_block_durable_before_another() {
    use featherstitch::{PatchgroupFlags, PatchgroupScope};

    let engine = Engine::shared(true);
    let mut disk = RawDiskBd::in_memory(512, 4, engine.clone());
    let owner = disk.handle();
    let mut scope = PatchgroupScope::new(engine.clone());

    let g1 = scope.create(PatchgroupFlags::empty()).unwrap();
    // Engaging g1 makes `scope.capture_before()` available to anyone
    // creating patches in the meantime; block A's write itself doesn't
    // need to be gated through it to exercise engage/disengage.
    scope.engage(g1).unwrap();
    assert!(scope.capture_before().is_some());
    let block_a = disk.synthetic_read_block(1).unwrap();
    engine.lock().create_byte(block_a, owner, 0, 4, Some(&[1, 1, 1, 1]), &[]).unwrap();
    scope.disengage(g1).unwrap();
    disk.write_block(block_a, 1).unwrap();

    let g2 = scope.create(PatchgroupFlags::empty()).unwrap();
    scope.add_depend(g2, g1).unwrap();
    scope.engage(g2).unwrap();
    let block_b = disk.synthetic_read_block(2).unwrap();
    engine.lock().create_byte(block_b, owner, 0, 4, Some(&[2, 2, 2, 2]), &[]).unwrap();
    scope.disengage(g2).unwrap();
    disk.write_block(block_b, 2).unwrap();

    assert!(scope.abandon(g1).is_err(), "an unreleased group must not be abandonable");
    scope.release(g1).unwrap();
    assert!(scope.abandon(g1).is_ok(), "a released group with no outstanding patches is abandonable");
}

struct SpyDevice {
    inner: RawDiskBd,
    writes: std::rc::Rc<std::cell::RefCell<Vec<featherstitch::BlockNumber>>>,
}

impl BlockDevice for SpyDevice {
    fn handle(&self) -> BdHandle {
        self.inner.handle()
    }
    fn engine(&self) -> &featherstitch::SharedEngine {
        self.inner.engine()
    }
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }
    fn num_blocks(&self) -> Option<featherstitch::BlockNumber> {
        self.inner.num_blocks()
    }
    fn read_block(&mut self, number: featherstitch::BlockNumber) -> featherstitch::Result<featherstitch::BdescId> {
        self.inner.read_block(number)
    }
    fn synthetic_read_block(&mut self, number: featherstitch::BlockNumber) -> featherstitch::Result<featherstitch::BdescId> {
        self.inner.synthetic_read_block(number)
    }
    fn write_block(&mut self, block: featherstitch::BdescId, number: featherstitch::BlockNumber) -> featherstitch::Result<()> {
        self.writes.borrow_mut().push(number);
        self.inner.write_block(block, number)
    }
    fn flush(&mut self, request: FlushRequest) -> featherstitch::Result<FlushResult> {
        self.inner.flush(request)
    }
}

#[test]
fn writing_past_the_dirty_budget_flushes_the_older_block_first() {
    use featherstitch::cache::WriteBackCacheBd;
    use featherstitch::config::EngineOptions;

    let engine = Engine::shared(true);
    let disk = RawDiskBd::in_memory(512, 64, engine.clone());
    let writes = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let spy = SpyDevice { inner: disk, writes: writes.clone() };

    let options = EngineOptions { block_size: 512, soft_blocks: 32, soft_dblocks: 1, ..EngineOptions::default() };
    let mut cache = WriteBackCacheBd::new(Box::new(spy), engine.clone(), options);
    let owner = cache.handle();

    let b10 = cache.synthetic_read_block(10).unwrap();
    engine.lock().create_byte(b10, owner, 0, 4, Some(&[1; 4]), &[]).unwrap();
    cache.write_block(b10, 10).unwrap();

    let b20 = cache.synthetic_read_block(20).unwrap();
    engine.lock().create_byte(b20, owner, 0, 4, Some(&[2; 4]), &[]).unwrap();
    cache.write_block(b20, 20).unwrap();

    let recorded = writes.borrow();
    assert_eq!(recorded.first(), Some(&10), "block 10 must reach the lower BD before block 20 forces it out");
    assert_eq!(recorded.iter().filter(|&&n| n == 10).count(), 1, "block 10 should be written exactly once");
}
