use itemsets::*;
use std::time::{Duration, Instant};

fn store_of(transactions: &[&[char]]) -> TransactionStore<char> {
    let mut store = TransactionStore::new();
    for t in transactions {
        store.add(t).unwrap();
    }
    store
}

fn config(min_support: f64) -> MiningConfig {
    MiningConfig {
        min_support,
        ..MiningConfig::default()
    }
}

fn listing(result: &ItemsetResult<char>) -> Vec<(String, f64)> {
    result
        .iter()
        .map(|f| (f.itemset().iter().collect(), f.support().fraction))
        .collect()
}

#[test]
fn four_transactions_at_half_support() {
    let store = store_of(&[&['a', 'b'], &['a', 'b', 'c'], &['a'], &['b', 'c']]);
    let result = mine(&store, &config(0.5)).unwrap();

    assert_eq!(
        listing(&result),
        vec![
            ("a".to_string(), 0.75),
            ("b".to_string(), 0.75),
            ("c".to_string(), 0.5),
            ("ab".to_string(), 0.5),
            ("bc".to_string(), 0.5),
        ]
    );
    assert!(result.get(&Itemset::new(&['a', 'c'])).is_none());
    assert!(result.get(&Itemset::new(&['a', 'b', 'c'])).is_none());

    let ab = result.get(&Itemset::new(&['a', 'b'])).unwrap();
    assert_eq!(ab.count, 2);
    assert_eq!(ab.weight, 2.0);
}

#[test]
fn empty_store_mines_nothing() {
    let store = TransactionStore::<char>::new();
    let result = mine(&store, &config(0.3)).unwrap();
    assert!(result.is_empty());
    assert_eq!(result.max_itemset_size(), 0);
    assert!(extract_rules(&result, 0.0).unwrap().is_empty());
}

#[test]
fn out_of_range_support_is_rejected() {
    let store = store_of(&[&['a']]);
    for &bad in [0.0, -0.1, 1.5, f64::NAN].iter() {
        match mine(&store, &config(bad)) {
            Err(MiningError::InvalidConfiguration { parameter, .. }) => {
                assert_eq!(parameter, "min_support")
            }
            other => panic!("min_support {} gave {:?}", bad, other),
        }
    }

    // Even an empty store fails fast.
    assert!(mine(&TransactionStore::<char>::new(), &config(0.0)).is_err());
}

#[test]
fn other_limits_are_validated() {
    let bad_size = MiningConfig {
        max_itemset_size: Some(0),
        ..MiningConfig::default()
    };
    assert!(bad_size.validate().is_err());

    let bad_confidence = MiningConfig {
        min_confidence: 1.01,
        ..MiningConfig::default()
    };
    assert!(bad_confidence.validate().is_err());

    let store = store_of(&[&['a']]);
    let result = mine(&store, &config(0.5)).unwrap();
    assert!(extract_rules(&result, -0.5).is_err());
}

#[test]
fn weighted_support_uses_transaction_weights() {
    let mut store = TransactionStore::new();
    store.add_weighted(&['a', 'b'], 2.0).unwrap();
    store.add_weighted(&['a'], 1.0).unwrap();
    assert_eq!(store.total_weight(), 3.0);

    let weighted = MiningConfig {
        min_support: 0.5,
        weighting_mode: WeightingMode::Weighted,
        ..MiningConfig::default()
    };
    let result = mine(&store, &weighted).unwrap();
    assert_eq!(result.mode(), WeightingMode::Weighted);

    assert_eq!(result.get(&Itemset::new(&['a'])).unwrap().fraction, 1.0);
    let ab = result.get(&Itemset::new(&['a', 'b'])).unwrap();
    assert_eq!(ab.fraction, 2.0 / 3.0);
    assert_eq!(ab.count, 1);
    assert_eq!(ab.weight, 2.0);

    // The same data is less supportive of {a,b} when every transaction counts the same.
    let plain = mine(&store, &config(0.6)).unwrap();
    assert!(plain.get(&Itemset::new(&['a', 'b'])).is_none());
}

#[test]
fn zero_total_weight_supports_nothing() {
    let mut store = TransactionStore::new();
    store.add_weighted(&['a'], 0.0).unwrap();
    let weighted = MiningConfig {
        min_support: 0.1,
        weighting_mode: WeightingMode::Weighted,
        ..MiningConfig::default()
    };
    assert!(mine(&store, &weighted).unwrap().is_empty());
}

#[test]
fn unit_weights_match_plain_support() {
    let store = store_of(&[
        &['a', 'b', 'd'],
        &['a', 'c'],
        &['b', 'c', 'd'],
        &['a', 'b', 'c', 'd'],
        &['d'],
    ]);
    let plain = mine(&store, &config(0.2)).unwrap();
    let weighted = mine(
        &store,
        &MiningConfig {
            weighting_mode: WeightingMode::Weighted,
            ..config(0.2)
        },
    )
    .unwrap();

    assert_eq!(listing(&plain), listing(&weighted));
    for (p, w) in plain.iter().zip(weighted.iter()) {
        assert_eq!(p.support(), w.support());
    }
}

#[test]
fn rejected_transactions_leave_the_store_unchanged() {
    let mut store = TransactionStore::new();
    store.add(&['a']).unwrap();

    assert_eq!(
        store.add_weighted(&['b'], -1.0),
        Err(MiningError::InvalidTransaction {
            id: 1,
            problem: TransactionProblem::NegativeWeight(-1.0),
        })
    );
    assert!(matches!(
        store.add_weighted(&['b'], f64::INFINITY),
        Err(MiningError::InvalidTransaction {
            problem: TransactionProblem::NonFiniteWeight(_),
            ..
        })
    ));
    assert_eq!(store.len(), 1);
    assert_eq!(store.total_weight(), 1.0);

    // Ids keep counting from where the accepted transactions left off.
    assert_eq!(store.add(&['b', 'b']), Ok(1));
    assert_eq!(store.get(1).unwrap().items(), &Itemset::new(&['b']));
    assert_eq!(store.get(1).unwrap().weight(), 1.0);
}

#[test]
fn unknown_items_are_reported() {
    let store = store_of(&[&['a', 'b']]);
    let index = TidlistIndex::build(&store);
    match index.support(&Itemset::new(&['a', 'z']), WeightingMode::Plain) {
        Err(MiningError::UnknownItem(item)) => assert_eq!(item, "'z'"),
        other => panic!("expected an unknown item, got {:?}", other),
    }
}

#[test]
fn empty_itemset_is_in_every_transaction() {
    let mut store = TransactionStore::new();
    store.add_weighted(&['a'], 0.5).unwrap();
    store.add_weighted(&['b'], 1.5).unwrap();
    let index = TidlistIndex::build(&store);

    let nil = Itemset::new(&[]);
    let plain = index.support(&nil, WeightingMode::Plain).unwrap();
    assert_eq!((plain.count, plain.fraction), (2, 1.0));
    let weighted = index.support(&nil, WeightingMode::Weighted).unwrap();
    assert_eq!((weighted.weight, weighted.fraction), (2.0, 1.0));
}

#[test]
fn index_is_built_in_transaction_order() {
    let mut store = TransactionStore::new();
    store.add_weighted(&['b', 'a'], 3.0).unwrap();
    store.add_weighted(&['c'], 1.0).unwrap();
    store.add_weighted(&['a', 'c'], 0.5).unwrap();
    let index = TidlistIndex::build(&store);

    assert_eq!(index.len(), 3);
    assert_eq!(index.transaction_count(), 3);
    assert_eq!(index.total_weight(), 4.5);

    let a = index.tidlist(&'a').unwrap();
    assert_eq!(a.tids(), &[0, 2]);
    assert_eq!(a.weighted().collect::<Vec<_>>(), vec![(0, 3.0), (2, 0.5)]);
    assert_eq!(a.total_weight(), 3.5);

    assert_eq!(index, TidlistIndex::build(&store));
}

#[test]
fn max_itemset_size_stops_the_search() {
    let store = store_of(&[&['a', 'b', 'c'], &['a', 'b', 'c'], &['a', 'b']]);

    let unlimited = mine(&store, &config(0.5)).unwrap();
    assert_eq!(unlimited.max_itemset_size(), 3);

    for limit in 1..=3 {
        let limited = mine(
            &store,
            &MiningConfig {
                max_itemset_size: Some(limit),
                ..config(0.5)
            },
        )
        .unwrap();
        assert_eq!(limited.max_itemset_size(), limit);
        let expected: Vec<_> = unlimited
            .iter()
            .filter(|f| f.itemset().len() <= limit)
            .cloned()
            .collect();
        assert_eq!(limited.iter().cloned().collect::<Vec<_>>(), expected);
    }
}

#[test]
fn size_distribution_counts_each_level() {
    let store = store_of(&[&['a', 'b', 'c'], &['a', 'b', 'c'], &['a', 'b']]);
    let result = mine(&store, &config(0.5)).unwrap();
    let sizes: Vec<_> = result.size_distribution().into_iter().collect();
    assert_eq!(sizes, vec![(1, 3), (2, 3), (3, 1)]);
}

#[test]
fn parallel_and_sequential_runs_agree() {
    let mut store = TransactionStore::new();
    for t in 0..200u32 {
        let mut items: Vec<u32> = (0..12).filter(|i| (t * 7 + i * 3) % (i + 2) != 0).collect();
        items.push(99);
        store.add(&items).unwrap();
    }
    let index = TidlistIndex::build(&store);

    let parallel = Miner::new(&index, config(0.3)).unwrap().run().unwrap();
    let sequential = Miner::new(
        &index,
        MiningConfig {
            parallel: false,
            ..config(0.3)
        },
    )
    .unwrap()
    .run()
    .unwrap();
    let again = Miner::new(&index, config(0.3)).unwrap().run().unwrap();

    assert!(!parallel.is_empty());
    assert_eq!(parallel, sequential);
    assert_eq!(parallel, again);
}

#[test]
fn expired_deadline_returns_no_partial_result() {
    let store = store_of(&[&['a', 'b'], &['a', 'b']]);
    let index = TidlistIndex::build(&store);
    let past = Instant::now();

    let outcome = Miner::new(&index, config(0.5))
        .unwrap()
        .with_deadline(past)
        .run();
    assert_eq!(outcome, Err(MiningError::DeadlineExceeded { level: 1 }));

    let generous = Instant::now() + Duration::from_secs(3600);
    let result = Miner::new(&index, config(0.5))
        .unwrap()
        .with_deadline(generous)
        .run()
        .unwrap();
    assert_eq!(result.len(), 3);
}

#[test]
fn candidates_are_joined_on_shared_prefixes() {
    let frequent = vec![
        Itemset::new(&[1, 2, 3]),
        Itemset::new(&[1, 2, 4]),
        Itemset::new(&[1, 3, 4]),
        Itemset::new(&[2, 3, 4]),
        Itemset::new(&[1, 2, 5]),
    ];
    assert_eq!(
        generate_candidates(&frequent),
        vec![Itemset::new(&[1, 2, 3, 4])]
    );

    let mut shuffled = frequent.clone();
    shuffled.reverse();
    shuffled.push(Itemset::new(&[1, 2, 3]));
    assert_eq!(generate_candidates(&shuffled), generate_candidates(&frequent));

    assert!(generate_candidates::<u8>(&[]).is_empty());
}

#[test]
fn singletons_seed_the_first_level() {
    let store = store_of(&[&['c', 'a'], &['b']]);
    let index = TidlistIndex::build(&store);
    assert_eq!(
        singleton_candidates(&index),
        vec![
            Itemset::new(&['a']),
            Itemset::new(&['b']),
            Itemset::new(&['c']),
        ]
    );
    assert_eq!(
        generate_candidates(&singleton_candidates(&index)).len(),
        3
    );
}

#[test]
fn rules_carry_confidence_and_lift() {
    let store = store_of(&[&['a', 'b'], &['a', 'b', 'c'], &['a'], &['b', 'c']]);
    let result = mine(&store, &config(0.5)).unwrap();
    let rules = extract_rules(&result, 0.0).unwrap();

    let described: Vec<_> = rules
        .iter()
        .map(|r| {
            (
                r.antecedent().iter().collect::<String>(),
                r.consequent().iter().collect::<String>(),
            )
        })
        .collect();
    let pairs: Vec<(&str, &str)> = described
        .iter()
        .map(|(a, c)| (a.as_str(), c.as_str()))
        .collect();
    assert_eq!(pairs, vec![("a", "b"), ("b", "a"), ("b", "c"), ("c", "b")]);

    let b_to_a = rules.iter().nth(1).unwrap();
    assert_eq!(b_to_a.support(), 0.5);
    assert_eq!(b_to_a.confidence(), 0.5 / 0.75);
    assert_eq!(b_to_a.lift(), (0.5 / 0.75) / 0.75);
    assert!(b_to_a.independence_alpha() > 0.0 && b_to_a.independence_alpha() <= 1.0);

    let confident = extract_rules(&result, 0.9).unwrap();
    assert_eq!(confident.len(), 1);
}

#[test]
fn rules_cover_every_split_of_larger_itemsets() {
    let store = store_of(&[&['x', 'y', 'z'], &['x', 'y', 'z'], &['x', 'y']]);
    let result = mine(&store, &config(0.6)).unwrap();
    assert!(result.get(&Itemset::new(&['x', 'y', 'z'])).is_some());

    let rules = extract_rules(&result, 0.0).unwrap();
    let from_xyz = rules
        .iter()
        .filter(|r| r.antecedent().len() + r.consequent().len() == 3)
        .count();
    assert_eq!(from_xyz, 6);

    for rule in rules.iter() {
        let union: Itemset<char> = rule
            .antecedent()
            .iter()
            .chain(rule.consequent().iter())
            .collect();
        assert_eq!(union.len(), rule.antecedent().len() + rule.consequent().len());
        assert!(result.get(&union).is_some());
    }
}

#[test]
fn engines_have_names() {
    assert_eq!(WeightingMode::Plain.name(), "Improved Apriori");
    assert_eq!(WeightingMode::Weighted.name(), "Weighted Apriori");
}

#[test]
fn unknown_config_fields_are_rejected() {
    assert!(serde_json::from_str::<MiningConfig>(r#"{"min_supp": 0.2}"#).is_err());

    let round_trip: MiningConfig =
        serde_json::from_str(&serde_json::to_string(&config(0.25)).unwrap()).unwrap();
    assert_eq!(round_trip, config(0.25));
}
