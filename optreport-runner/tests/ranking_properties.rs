//! Property tests for trade ranking.

use chrono::NaiveDate;
use proptest::prelude::*;

use optreport_core::{OptionTrade, OptionType};
use optreport_runner::config::FilterConfig;
use optreport_runner::stages::rank_trades;

fn arb_trade() -> impl Strategy<Value = OptionTrade> {
    (
        -2i64..12,
        0.0f64..5_000_000.0,
        any::<bool>(),
        proptest::option::of(0.01f64..50.0),
        proptest::option::of(0.01f64..50.0),
        0u32..1000,
    )
        .prop_map(|(count, volume, is_call, last, avg, n)| OptionTrade {
            trade_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            symbol: format!("PETR{n}"),
            underlying: "PETR4".to_string(),
            option_type: if is_call { OptionType::Call } else { OptionType::Put },
            maturity_date: NaiveDate::from_ymd_opt(2024, 2, 16).unwrap(),
            strike_price: Some(30.0),
            trade_count: count,
            contracts: count.max(0) * 100,
            financial_volume: volume,
            last_price: last,
            average_price: avg,
        })
}

fn arb_filters() -> impl Strategy<Value = FilterConfig> {
    (0.0f64..1_000_000.0, 1i64..10, 1usize..30).prop_map(|(min, max_ops, top_n)| FilterConfig {
        min_financial_volume: min,
        max_operations: max_ops,
        top_n,
    })
}

proptest! {
    #[test]
    fn ranked_trades_respect_filters_and_order(
        trades in proptest::collection::vec(arb_trade(), 0..60),
        filters in arb_filters(),
    ) {
        let expected_dropped = trades.iter().filter(|t| t.trade_count <= 0).count();
        let total = trades.len();
        let out = rank_trades(trades, &filters);

        prop_assert_eq!(out.stats.total_options, total);
        prop_assert_eq!(out.stats.dropped_rows, expected_dropped);
        prop_assert!(out.ranked.len() <= filters.top_n);
        prop_assert!(out.ranked.len() <= out.stats.after_filters);
        prop_assert_eq!(out.stats.calls + out.stats.puts, out.ranked.len());

        for (i, r) in out.ranked.iter().enumerate() {
            prop_assert_eq!(r.rank, i + 1);
            prop_assert!(r.trade.trade_count > 0);
            prop_assert!(r.trade.trade_count <= filters.max_operations);
            prop_assert!(r.trade.financial_volume >= filters.min_financial_volume);
            prop_assert_eq!(r.price, r.trade.average_price.or(r.trade.last_price));
        }
        for pair in out.ranked.windows(2) {
            prop_assert!(pair[0].average_ticket >= pair[1].average_ticket);
        }
    }

    #[test]
    fn top_n_is_a_prefix_of_a_larger_ranking(
        trades in proptest::collection::vec(arb_trade(), 0..40),
        filters in arb_filters(),
    ) {
        let small = rank_trades(trades.clone(), &filters);
        let wide = FilterConfig { top_n: filters.top_n + 10, ..filters.clone() };
        let large = rank_trades(trades, &wide);

        prop_assert_eq!(small.stats.after_filters, large.stats.after_filters);
        for (a, b) in small.ranked.iter().zip(large.ranked.iter()) {
            prop_assert_eq!(&a.trade.symbol, &b.trade.symbol);
            prop_assert_eq!(a.rank, b.rank);
        }
    }
}
