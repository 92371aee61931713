//! End-to-end completion coordination scenarios.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use converge::test_utils::init_test_logging;
use converge::{
    invoke_all_timeout, invoke_any, CompletionQueue, Cx, TaskFn, ThreadExecutor,
};

fn init_test(name: &str) {
    init_test_logging();
    converge::test_phase!(name);
}

fn task<T: Send + 'static>(mut f: impl FnMut() -> T + Send + 'static) -> TaskFn<T> {
    Box::new(move || Ok(f()))
}

#[test]
fn invoke_any_prefers_the_task_that_finishes() {
    init_test("invoke_any_prefers_the_task_that_finishes");
    let executor = ThreadExecutor::new();
    let cx = Cx::for_testing();

    let mut tasks: Vec<TaskFn<u32>> = Vec::new();
    for i in 0..3u32 {
        tasks.push(task(move || {
            if i == 1 {
                thread::sleep(Duration::from_millis(10));
                i
            } else {
                // Effectively never returns within the test horizon.
                thread::sleep(Duration::from_secs(60));
                i
            }
        }));
    }

    let value = invoke_any(&executor, &cx, tasks).expect("invoke_any failed");
    converge::assert_with_log!(value == 1, "task #2 wins", 1u32, value);
    converge::test_complete!("invoke_any_prefers_the_task_that_finishes");
}

#[test]
fn invoke_all_deadline_keeps_positions_and_cancels_the_rest() {
    init_test("invoke_all_deadline_keeps_positions_and_cancels_the_rest");
    let executor = ThreadExecutor::new();
    let cx = Cx::for_testing();

    let mut tasks: Vec<TaskFn<usize>> = Vec::new();
    for position in 0..5usize {
        tasks.push(task(move || {
            if position < 2 {
                position
            } else {
                thread::sleep(Duration::from_secs(60));
                position
            }
        }));
    }

    let results = invoke_all_timeout(&executor, &cx, tasks, Duration::from_millis(200))
        .expect("invoke_all failed");
    converge::assert_with_log!(results.len() == 5, "positional entries", 5usize, results.len());

    for (position, result) in results.iter().enumerate() {
        if position < 2 {
            let value = result.join(&cx).expect("finished task has a value");
            converge::assert_with_log!(value == position, "position matches", position, value);
        } else {
            let cancelled = result.is_cancelled();
            converge::assert_with_log!(cancelled, "unfinished task cancelled", true, cancelled);
        }
    }
    converge::test_complete!("invoke_all_deadline_keeps_positions_and_cancels_the_rest");
}

#[test]
fn completion_queue_drives_first_success_and_cancellation() {
    init_test("completion_queue_drives_first_success_and_cancellation");
    let executor = ThreadExecutor::new();
    let queue = CompletionQueue::new();
    let cx = Cx::for_testing();

    let mut handles = Vec::new();
    for i in 0..3u32 {
        let handle = queue
            .submit(
                &executor,
                task(move || {
                    if i == 1 {
                        thread::sleep(Duration::from_millis(10));
                        i
                    } else {
                        thread::sleep(Duration::from_secs(60));
                        i
                    }
                }),
            )
            .expect("submit failed");
        handles.push(handle);
    }

    let winner = queue.take(&cx).expect("take failed");
    let value = winner.join(&cx).expect("winner value");
    converge::assert_with_log!(value == 1, "completion order winner", 1u32, value);

    // Cancel the stragglers with interruption requested; the winner's
    // stored outcome is untouched.
    for handle in &handles {
        handle.cancel(true);
    }
    let still = winner.join(&cx).expect("outcome immutable after cancel");
    converge::assert_with_log!(still == 1, "winner outcome intact", 1u32, still);

    let cancelled = handles
        .iter()
        .filter(|handle| handle.is_cancelled())
        .count();
    converge::assert_with_log!(cancelled == 2, "stragglers cancelled", 2usize, cancelled);
    converge::test_complete!("completion_queue_drives_first_success_and_cancellation");
}

#[test]
fn completion_queue_interleaves_producers_and_consumers() {
    init_test("completion_queue_interleaves_producers_and_consumers");
    let executor = ThreadExecutor::new();
    let queue: Arc<CompletionQueue<u32>> = Arc::new(CompletionQueue::new());
    const TASKS: u32 = 12;

    for i in 0..TASKS {
        queue
            .submit(&executor, task(move || i))
            .expect("submit failed");
    }

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let cx = Cx::for_testing();
            let mut seen = Vec::new();
            for _ in 0..TASKS {
                let settled = queue.take(&cx).expect("take failed");
                seen.push(settled.join(&cx).expect("settled value"));
            }
            seen
        })
    };

    let mut seen = consumer.join().expect("consumer panicked");
    seen.sort_unstable();
    let expected: Vec<u32> = (0..TASKS).collect();
    converge::assert_with_log!(seen == expected, "every task consumed once", expected, seen);
    assert!(queue.is_empty());
    converge::test_complete!("completion_queue_interleaves_producers_and_consumers");
}
