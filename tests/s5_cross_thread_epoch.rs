//! `spec.md` §8 scenario S5 (cross-thread epoch): two threads each
//! `enter`, allocate, sleep, `free` (retire), and `exit` on one shared
//! [`EpochDomain`], with overlapping critical sections; a flush must
//! never reclaim an item before every thread that was entered at (or
//! before) its retire epoch has exited.
//!
//! `epoch.rs`'s unit tests cover a single retiring thread observed by the
//! retiring thread itself; this drives two genuinely concurrent threads
//! whose critical sections overlap, and checks the reclaim only happens
//! after both have exited.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sandrt::epoch::EpochDomain;

#[test]
fn reclaim_waits_for_every_overlapping_reader_to_exit() {
    let domain = Arc::new(EpochDomain::new());
    let exits: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    let frees: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

    let t1 = {
        let domain = Arc::clone(&domain);
        let exits = Arc::clone(&exits);
        let frees = Arc::clone(&frees);
        thread::spawn(move || {
            let guard = domain.enter();
            thread::sleep(Duration::from_millis(30));
            let frees = Arc::clone(&frees);
            domain.retire(Box::new(move || {
                frees.lock().unwrap().push(("t1", Instant::now()));
            }));
            drop(guard);
            exits.lock().unwrap().push(("t1", Instant::now()));
        })
    };

    let t2 = {
        let domain = Arc::clone(&domain);
        let exits = Arc::clone(&exits);
        let frees = Arc::clone(&frees);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let guard = domain.enter();
            thread::sleep(Duration::from_millis(40));
            let frees = Arc::clone(&frees);
            domain.retire(Box::new(move || {
                frees.lock().unwrap().push(("t2", Instant::now()));
            }));
            drop(guard);
            exits.lock().unwrap().push(("t2", Instant::now()));
        })
    };

    // Poll flush concurrently with both critical sections, the way a
    // runtime's background/explicit reclaim loop would.
    let poller = {
        let domain = Arc::clone(&domain);
        thread::spawn(move || {
            for _ in 0..20 {
                domain.flush();
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    t1.join().unwrap();
    t2.join().unwrap();
    poller.join().unwrap();
    domain.flush();

    let exits = exits.lock().unwrap();
    let frees = frees.lock().unwrap();
    assert_eq!(frees.len(), 2, "both retired items must eventually reclaim");

    let exit_time = |name: &str| exits.iter().find(|(n, _)| *n == name).unwrap().1;
    let both_exited_by = exit_time("t1").max(exit_time("t2"));

    for (name, freed_at) in frees.iter() {
        assert!(
            *freed_at >= both_exited_by,
            "{name}'s retired item reclaimed before every overlapping reader exited"
        );
    }
}
