use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use usage_beacon::core::clock::{Clock, ManualClock};
use usage_beacon::logger::dual::ActivityLoggerHandle;
use usage_beacon::metrics::aggregator::Aggregator;
use usage_beacon::metrics::consent::ConsentGate;
use usage_beacon::store::backend::MemoryBackend;
use usage_beacon::store::counter_store::{CounterStore, Side};

#[derive(Debug, Clone)]
enum Call {
    AppOpen,
    DailyOpen,
    Tool(String),
    Ad(String),
    AdvanceHours(i64),
}

fn call() -> impl Strategy<Value = Call> {
    prop_oneof![
        Just(Call::AppOpen),
        Just(Call::DailyOpen),
        "[a-z ]{0,6}".prop_map(Call::Tool),
        "[a-z ]{0,6}".prop_map(Call::Ad),
        (1i64..30).prop_map(Call::AdvanceHours),
    ]
}

fn setup(granted: Option<bool>) -> (Arc<CounterStore>, Aggregator, Arc<ManualClock>) {
    let store = Arc::new(CounterStore::new(
        Arc::new(MemoryBackend::new()),
        ActivityLoggerHandle::noop(),
    ));
    let consent = ConsentGate::new(Arc::clone(&store)).unwrap();
    if let Some(granted) = granted {
        consent.set_consent(granted).unwrap();
    }
    let clock = Arc::new(ManualClock::utc(
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
    ));
    let aggregator = Aggregator::new(
        Arc::clone(&store),
        consent,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    (store, aggregator, clock)
}

fn apply(aggregator: &Aggregator, clock: &ManualClock, call: &Call) {
    match call {
        Call::AppOpen => {
            aggregator.record_app_open().unwrap();
        }
        Call::DailyOpen => {
            aggregator.record_daily_open_once().unwrap();
        }
        Call::Tool(id) => {
            aggregator.record_tool_use(id).unwrap();
        }
        Call::Ad(ad) => {
            aggregator.record_ad_impression(ad).unwrap();
        }
        Call::AdvanceHours(h) => clock.advance(Duration::hours(*h)),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn recording_without_consent_never_writes(
        denied in any::<bool>(),
        calls in prop::collection::vec(call(), 0..40),
    ) {
        // Denied and undecided both mean "do not collect".
        let (store, aggregator, clock) = setup(denied.then_some(false));
        let before = store.keys().unwrap();
        for c in &calls {
            apply(&aggregator, &clock, c);
        }
        prop_assert_eq!(store.keys().unwrap(), before);
        prop_assert!(store.load(Side::Raw).unwrap().is_empty());
    }

    #[test]
    fn daily_open_adds_exactly_one_per_day(
        repeats in 1usize..10,
        extra_days in 0i64..5,
    ) {
        let (store, aggregator, clock) = setup(Some(true));
        for day in 0..=extra_days {
            if day > 0 {
                clock.advance(Duration::days(1));
            }
            let today = clock.today();
            let before = store.load(Side::Raw).unwrap().app_opens.get(&today).copied().unwrap_or(0);
            for _ in 0..repeats {
                aggregator.record_daily_open_once().unwrap();
            }
            let after = store.load(Side::Raw).unwrap().app_opens.get(&today).copied().unwrap_or(0);
            prop_assert_eq!(after, before + 1);
        }
    }

    #[test]
    fn plain_app_opens_are_counted_exactly(n in 0u64..50) {
        let (store, aggregator, clock) = setup(Some(true));
        for _ in 0..n {
            aggregator.record_app_open().unwrap();
        }
        let total = store
            .load(Side::Raw)
            .unwrap()
            .app_opens
            .get(&clock.today())
            .copied()
            .unwrap_or(0);
        prop_assert_eq!(total, n);
    }
}
