use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rotary_channel::pipe;
use rotary_messaging::{
  Control, MessageBus, MessagePatcher, MessageThreadRegistry, MessagingError, MessagingScheduler,
  ReplyHandler, SharedControl,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(1));

fn endpoints() -> (MessageBus<u32>, MessageBus<u32>) {
  let (left, right) = pipe();
  (MessageBus::new(left), MessageBus::new(right))
}

fn pump(bus: &MessageBus<u32>, registry: &MessageThreadRegistry<u32>) -> Vec<SharedControl<u32>> {
  bus
    .recv_and_process_message(registry, WAIT)
    .unwrap()
    .expect("an envelope should arrive")
}

fn recording_handler(seen: &Arc<Mutex<Vec<u32>>>, keep: bool) -> ReplyHandler<u32> {
  let seen = Arc::clone(seen);
  Box::new(move |control: &mut Control<u32>| {
    if let Some(value) = control.reply() {
      seen.lock().push(*value);
    }
    control.keep_control = keep;
    None
  })
}

#[test]
fn test_request_reply_round_trip() {
  let (caller, callee) = endpoints();
  let caller_registry = MessageThreadRegistry::new();
  let callee_registry = MessageThreadRegistry::new();

  callee.add_listener(Some("echo"), |control| {
    control.reply_to_message = true;
    control.reply().map(|value| value + 1)
  });

  let seen = Arc::new(Mutex::new(Vec::new()));
  let control = caller
    .request(Some("echo"), Some(41), recording_handler(&seen, false))
    .unwrap();
  caller_registry.append(Arc::clone(&control));

  let handled = pump(&callee, &callee_registry);
  assert_eq!(handled.len(), 1);
  assert!(callee_registry.is_empty());

  pump(&caller, &caller_registry);
  assert_eq!(*seen.lock(), vec![42]);
  assert!(caller_registry.is_empty());
  assert_eq!(control.lock().history().len(), 2);
}

#[test]
fn test_listener_without_reply_sends_nothing() {
  let (caller, callee) = endpoints();
  let callee_registry = MessageThreadRegistry::new();
  callee.add_listener(Some("sink"), |_| Some(7));

  caller.post(Some("sink"), Some(1)).unwrap();
  pump(&callee, &callee_registry);

  let nothing = caller
    .recv_and_process_message(&MessageThreadRegistry::new(), Some(Duration::from_millis(30)))
    .unwrap();
  assert!(nothing.is_none());
}

#[test]
fn test_deferred_reply_reaches_waiting_control() {
  let (caller, callee) = endpoints();
  let caller_registry = MessageThreadRegistry::new();
  let callee_registry = MessageThreadRegistry::new();

  let parked: Arc<Mutex<Option<SharedControl<u32>>>> = Arc::new(Mutex::new(None));
  let slot = Arc::clone(&parked);
  callee.add_listener(Some("later"), move |control| {
    control.keep_control = true;
    *slot.lock() = control.handle().ok();
    None
  });

  let seen = Arc::new(Mutex::new(Vec::new()));
  let control = caller
    .request(Some("later"), Some(1), recording_handler(&seen, true))
    .unwrap();
  caller_registry.append(control);

  pump(&callee, &callee_registry);
  assert_eq!(callee_registry.len(), 1);

  let parked = parked.lock().clone().unwrap();
  callee.deferred_reply(&mut parked.lock(), Some(10)).unwrap();
  callee.deferred_reply(&mut parked.lock(), Some(11)).unwrap();

  pump(&caller, &caller_registry);
  pump(&caller, &caller_registry);
  assert_eq!(*seen.lock(), vec![10, 11]);
  assert_eq!(caller_registry.len(), 1);
}

#[test]
fn test_caller_follow_up_reaches_callee_control() {
  let (caller, callee) = endpoints();
  let caller_registry = MessageThreadRegistry::new();
  let callee_registry = MessageThreadRegistry::new();

  let received = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&received);
  callee.add_listener(Some("session"), move |control| {
    sink.lock().push(*control.reply().unwrap_or(&0));
    control.keep_control = true;
    control.reply_to_message = true;
    Some(0)
  });

  let control = caller
    .request(
      Some("session"),
      Some(1),
      Box::new(|control: &mut Control<u32>| {
        control.keep_control = true;
        None
      }),
    )
    .unwrap();
  caller_registry.append(Arc::clone(&control));

  pump(&callee, &callee_registry);
  pump(&caller, &caller_registry);
  caller.deferred_reply(&mut control.lock(), Some(2)).unwrap();
  pump(&callee, &callee_registry);

  assert_eq!(*received.lock(), vec![1, 2]);
  assert_eq!(callee_registry.len(), 1);
}

#[test]
fn test_unknown_target_is_an_error() {
  let (caller, callee) = endpoints();
  let callee_registry = MessageThreadRegistry::new();
  callee.add_listener(Some("gone"), |control| {
    control.reply_to_message = true;
    Some(0)
  });

  let control = caller
    .request(Some("gone"), Some(1), Box::new(|_: &mut Control<u32>| None))
    .unwrap();
  pump(&callee, &callee_registry);

  let result = caller.recv_and_process_message(&MessageThreadRegistry::new(), WAIT);
  let expected = control.lock().id();
  assert!(matches!(result, Err(MessagingError::UnknownControl(id)) if id == expected));
}

#[test]
fn test_spent_control_rejects_second_delivery() {
  let (caller, callee) = endpoints();
  let caller_registry = MessageThreadRegistry::new();
  let callee_registry = MessageThreadRegistry::new();
  callee.add_listener(Some("once"), |control| {
    control.reply_to_message = true;
    Some(0)
  });

  let control = caller
    .request(Some("once"), Some(1), Box::new(|_: &mut Control<u32>| None))
    .unwrap();
  caller_registry.append(Arc::clone(&control));
  pump(&callee, &callee_registry);
  pump(&caller, &caller_registry);

  assert!(control.lock().is_feedback_pending());
  let envelope = control.lock().history()[1].1.clone();
  let again = caller.handle_message(&control, envelope.clone());
  assert!(matches!(again, Err(MessagingError::FeedbackPending(_))));

  control.lock().reset_feedback();
  assert!(caller.handle_message(&control, envelope).is_ok());
}

#[test]
fn test_topic_listeners_run_before_wildcards() {
  let (caller, callee) = endpoints();
  let registry = MessageThreadRegistry::new();
  let order = Arc::new(Mutex::new(Vec::new()));

  let wildcard = Arc::clone(&order);
  callee.add_listener(None, move |_| {
    wildcard.lock().push("wildcard");
    None
  });
  let topical = Arc::clone(&order);
  callee.add_listener(Some("news"), move |_| {
    topical.lock().push("news");
    None
  });

  caller.post(Some("news"), Some(1)).unwrap();
  let controls = pump(&callee, &registry);
  assert_eq!(controls.len(), 2);
  assert_eq!(*order.lock(), vec!["news", "wildcard"]);

  caller.post(Some("weather"), Some(1)).unwrap();
  pump(&callee, &registry);
  assert_eq!(*order.lock(), vec!["news", "wildcard", "wildcard"]);
}

#[test]
fn test_new_exchanges_get_distinct_threads() {
  let (caller, callee) = endpoints();
  let registry = MessageThreadRegistry::new();
  callee.add_listener(Some("jobs"), |control| {
    control.keep_control = true;
    None
  });

  for n in 0..3 {
    caller.post(Some("jobs"), Some(n)).unwrap();
    pump(&callee, &registry);
  }

  let threads: Vec<String> = registry
    .controls()
    .iter()
    .filter_map(|control| control.lock().thread().map(|t| t.to_string()))
    .collect();
  assert_eq!(threads.len(), 3);
  assert_ne!(threads[0], threads[1]);
  assert_ne!(threads[1], threads[2]);
  assert_ne!(threads[0], threads[2]);
}

#[test]
fn test_first_matching_patch_wins() {
  let (caller, callee) = endpoints();
  let registry = MessageThreadRegistry::new();

  callee.add_listener(Some("calc"), |control| {
    control.reply_to_message = true;
    control.reply().copied()
  });

  callee.patch(MessagePatcher::new(
    |control: &Control<u32>| control.reply() == Some(&5),
    |control: &mut Control<u32>, original: &mut ReplyHandler<u32>| original(control).map(|v| v * 100),
  ));
  callee.patch(MessagePatcher::new(
    |_: &Control<u32>| true,
    |control: &mut Control<u32>, _: &mut ReplyHandler<u32>| {
      control.reply_to_message = true;
      Some(0)
    },
  ));

  let replies = Arc::new(Mutex::new(Vec::new()));
  let caller_registry = MessageThreadRegistry::new();
  for value in [5, 6] {
    let control = caller
      .request(Some("calc"), Some(value), recording_handler(&replies, false))
      .unwrap();
    caller_registry.append(control);
    pump(&callee, &registry);
    pump(&caller, &caller_registry);
  }

  assert_eq!(*replies.lock(), vec![500, 0]);
}

#[test]
fn test_unselected_patch_leaves_handler_alone() {
  let (caller, callee) = endpoints();
  let registry = MessageThreadRegistry::new();

  callee.add_listener(Some("calc"), |control| {
    control.reply_to_message = true;
    control.reply().map(|v| v + 1)
  });
  callee.patch(MessagePatcher::new(
    |control: &Control<u32>| control.reply() == Some(&99),
    |_: &mut Control<u32>, _: &mut ReplyHandler<u32>| Some(0),
  ));

  let replies = Arc::new(Mutex::new(Vec::new()));
  let caller_registry = MessageThreadRegistry::new();
  let control = caller
    .request(Some("calc"), Some(1), recording_handler(&replies, false))
    .unwrap();
  caller_registry.append(control);
  pump(&callee, &registry);
  pump(&caller, &caller_registry);

  assert_eq!(*replies.lock(), vec![2]);
}

#[test]
fn test_scheduler_drives_both_endpoints() {
  let (caller, callee) = endpoints();
  let caller_registry = MessageThreadRegistry::new();
  let callee_registry = MessageThreadRegistry::new();
  let mut scheduler = MessagingScheduler::new();

  callee.add_listener(Some("square"), |control| {
    control.reply_to_message = true;
    control.reply().map(|v| v * v)
  });

  let bus = callee.clone();
  let registry = callee_registry.clone();
  scheduler.add_source(
    callee.channel(),
    move |envelope| bus.process_new_message(&registry, envelope).map(|_| ()),
    WAIT,
  );

  let bus = caller.clone();
  let registry = caller_registry.clone();
  scheduler.add_source(
    caller.channel(),
    move |envelope| bus.process_new_message(&registry, envelope).map(|_| ()),
    WAIT,
  );

  let handle = scheduler.handle();
  let answers = Arc::new(AtomicUsize::new(0));
  let sink = Arc::clone(&answers);
  let control = caller
    .request(
      Some("square"),
      Some(9),
      Box::new(move |control: &mut Control<u32>| {
        sink.store(*control.reply().unwrap_or(&0) as usize, Ordering::SeqCst);
        handle.dispose();
        None
      }),
    )
    .unwrap();
  caller_registry.append(control);

  scheduler.run().unwrap();
  assert_eq!(answers.load(Ordering::SeqCst), 81);
}
