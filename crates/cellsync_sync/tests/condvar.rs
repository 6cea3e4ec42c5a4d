use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use cellsync_mem::{SharedRegion, SharedAddress, Unit, BLOCK_SIZE};
use cellsync_sync::*;

struct Shared {
    cond  : Condvar,
    mutex : RemoteMutex,
}

fn setup() -> (std::sync::Arc<SharedRegion>, Shared) {
    let region = SharedRegion::new(2 * BLOCK_SIZE);
    let shared = Shared {
        cond: Condvar::at(SharedAddress::ZERO),
        mutex: RemoteMutex::at(SharedAddress::new(BLOCK_SIZE as u64)),
    };
    let unit = Unit::new(region.clone());
    shared.cond.init(&unit);
    shared.mutex.init(&unit);
    (region, shared)
}

fn wait_for_waiters(unit: &Unit, cond: &Condvar, count: u32) {
    while cond.waiters(unit) != count {
        std::thread::yield_now();
    }
}

#[test]
fn signal_releases_exactly_one() {
    let (region, Shared { cond, mutex }) = setup();
    let woken = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..3 {
            let region = region.clone();
            let woken = &woken;
            s.spawn(move || {
                let unit = Unit::new(region);
                let _guard = mutex.guard(&unit);
                cond.wait(&unit, &mutex);
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }

        let unit = Unit::new(region.clone());
        wait_for_waiters(&unit, &cond, 3);

        cond.signal(&unit);
        while woken.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(cond.waiters(&unit), 2);

        cond.broadcast(&unit);
    });

    assert_eq!(woken.load(Ordering::SeqCst), 3);
}

#[test]
fn broadcast_skips_later_waiters() {
    let (region, Shared { cond, mutex }) = setup();
    let woken = AtomicUsize::new(0);

    std::thread::scope(|s| {
        let spawn_waiter = || {
            let region = region.clone();
            let woken = &woken;
            s.spawn(move || {
                let unit = Unit::new(region);
                mutex.lock(&unit);
                cond.wait(&unit, &mutex);
                mutex.unlock(&unit);
                woken.fetch_add(1, Ordering::SeqCst);
            })
        };

        let unit = Unit::new(region.clone());
        let early: Vec<_> = (0..4).map(|_| spawn_waiter()).collect();
        wait_for_waiters(&unit, &cond, 4);

        cond.broadcast(&unit);
        for handle in early {
            handle.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);

        let late = spawn_waiter();
        wait_for_waiters(&unit, &cond, 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::SeqCst), 4);

        cond.signal(&unit);
        late.join().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 5);
    });
}

#[test]
fn semaphore_never_goes_negative() {
    const ROUNDS : usize = 300;

    let region = SharedRegion::new(4 * BLOCK_SIZE);
    let sem = Resource::<Semaphore>::create(&region, 0).unwrap();

    std::thread::scope(|s| {
        for _ in 0..2 {
            let consumer = sem.clone();
            s.spawn(move || {
                for _ in 0..ROUNDS {
                    consumer.get().wait(consumer.unit());
                    assert!(consumer.get().value(consumer.unit()) >= 0);
                }
            });
        }

        let producer = sem.clone();
        s.spawn(move || {
            for i in 0..2 * ROUNDS {
                producer.get().post(producer.unit());
                if i % 50 == 0 {
                    std::thread::yield_now();
                }
            }
        });
    });

    assert_eq!(sem.get().value(sem.unit()), 0);
    assert_eq!(sem.refcount(), 1);
}
