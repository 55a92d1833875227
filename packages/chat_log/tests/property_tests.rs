use std::sync::Arc;

use proptest::prelude::*;

use chat_log::{BroadcastLog, Identity, Message, Position, sanitize_line};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn identity(n: usize) -> Identity {
    Identity::parse(&format!("chat{n:02}")).unwrap()
}

// --- Total order across tails ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_tail_observes_the_same_sequence(
        plan in prop::collection::vec((0usize..4, "[a-z]{1,12}", 0u8..4), 1..40),
        readers in 2usize..5,
    ) {
        let (observed, on_disk) = runtime().block_on(async move {
            let tmp = tempfile::tempdir().unwrap();
            let path = tmp.path().join("chat.log");
            let log = Arc::new(BroadcastLog::open(&path).await.unwrap());
            let total = plan.len();

            let tails: Vec<_> = (0..readers)
                .map(|_| {
                    let mut tail = log.tail_from(Position(0));
                    tokio::spawn(async move {
                        let mut seen = Vec::with_capacity(total);
                        for _ in 0..total {
                            seen.push(tail.next().await.unwrap());
                        }
                        seen
                    })
                })
                .collect();

            let writers: Vec<_> = plan
                .into_iter()
                .map(|(who, text, yields)| {
                    let log = log.clone();
                    tokio::spawn(async move {
                        for _ in 0..yields {
                            tokio::task::yield_now().await;
                        }
                        log.append(&identity(who), &text).await.unwrap()
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap();
            }

            let mut observed = Vec::new();
            for tail in tails {
                let seen: Vec<Message> = tail.await.unwrap().iter().map(|m| (**m).clone()).collect();
                observed.push(seen);
            }

            drop(log);
            let reopened = BroadcastLog::open(&path).await.unwrap();
            let on_disk: Vec<Message> = reopened
                .recent(total)
                .await
                .iter()
                .map(|m| (**m).clone())
                .collect();
            (observed, on_disk)
        });

        for seen in &observed {
            prop_assert_eq!(seen, &observed[0]);
        }
        prop_assert_eq!(&observed[0], &on_disk);
    }
}

// --- Durability ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn acknowledged_appends_survive_reopen(
        texts in prop::collection::vec("[ -~]{1,60}", 1..20),
    ) {
        let (written, replayed) = runtime().block_on(async move {
            let tmp = tempfile::tempdir().unwrap();
            let path = tmp.path().join("chat.log");

            let mut written = Vec::new();
            {
                let log = BroadcastLog::open(&path).await.unwrap();
                for text in &texts {
                    let position = log.append(&identity(1), text).await.unwrap();
                    written.push((position, text.clone()));
                }
            }

            let log = BroadcastLog::open(&path).await.unwrap();
            let replayed: Vec<String> = log
                .recent(usize::MAX)
                .await
                .iter()
                .map(|m| m.text.clone())
                .collect();
            (written, replayed)
        });

        prop_assert_eq!(written.len(), replayed.len());
        for (i, (position, text)) in written.iter().enumerate() {
            prop_assert_eq!(position.0, i as u64);
            prop_assert_eq!(text, &replayed[i]);
        }
    }
}

// --- Sanitizing ---

proptest! {
    #[test]
    fn sanitized_lines_are_single_printable_lines(raw in "\\PC{0,80}|[\\x00-\\x1f\\x7f a-z]{0,40}") {
        if let Ok(line) = sanitize_line(&raw, 64) {
            prop_assert!(!line.is_empty());
            prop_assert!(line.len() <= 64);
            prop_assert!(!line.chars().any(char::is_control));
            prop_assert_eq!(line.trim(), line.as_str());
        }
    }
}
