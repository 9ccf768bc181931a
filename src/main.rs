use anyhow::{bail, Context};
use clap::Parser;
use csv_core::{ReadFieldResult, Reader, ReaderBuilder};
use itemsets::*;
use lasso::{Rodeo, RodeoResolver, Spur};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::str;

#[derive(Parser, Debug)]
#[command(
    name = "itemsets",
    about = "Mine frequent itemsets and association rules from tab-separated transactions"
)]
struct Cli {
    /// Read transactions from this file instead of stdin
    #[arg(long)]
    input: Option<PathBuf>,
    /// JSON file holding a mining configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// Minimum support fraction, in (0, 1]
    #[arg(long)]
    min_support: Option<f64>,
    /// Minimum rule confidence, in [0, 1]
    #[arg(long)]
    min_confidence: Option<f64>,
    /// Largest itemset size to mine
    #[arg(long)]
    max_size: Option<usize>,
    /// Measure support by transaction weight
    #[arg(long)]
    weighted: bool,
    /// Evaluate candidates on a single thread
    #[arg(long)]
    sequential: bool,
    /// Also print association rules
    #[arg(long)]
    rules: bool,
}

/// The line a field came from. csv-core counts a record's terminating newline as soon as it is
/// consumed, so a field that ended its record on `\n` is one line behind `tsv.line()`.
fn field_line(tsv: &Reader, consumed: &[u8]) -> u64 {
    if consumed.last() == Some(&b'\n') {
        tsv.line() - 1
    } else {
        tsv.line()
    }
}

/// Reads one transaction per line. If the first field of a line parses as a finite number, it is
/// the transaction's weight; every other non-empty field is an item name. Fields are never quoted,
/// and a first field such as `NaN` or `inf` is an item, not a weight.
fn load_transactions<R: io::Read, I: ItemId + lasso::Key>(
    mut input: R,
) -> anyhow::Result<(RodeoResolver<I>, TransactionStore<I>)> {
    let mut inputbuf = [0; 16384];
    let mut fieldbuf = [0; 1024];
    let mut fieldlen = 0;
    let mut record = Vec::new();
    let mut first_field = true;
    let mut weight = None;
    let mut store = TransactionStore::new();
    let mut rodeo = Rodeo::new();
    let mut tsv = ReaderBuilder::new().delimiter(b'\t').quoting(false).build();

    loop {
        let read = input.read(&mut inputbuf)?;
        let mut bytes = &inputbuf[..read];
        loop {
            let (result, nin, nout) = tsv.read_field(bytes, &mut fieldbuf[fieldlen..]);
            let line = field_line(&tsv, &bytes[..nin]);
            bytes = &bytes[nin..];
            fieldlen += nout;
            match result {
                ReadFieldResult::InputEmpty => break,
                ReadFieldResult::OutputFull => {
                    bail!("item name too long on line {}", line);
                }
                ReadFieldResult::Field { record_end } => {
                    let field = str::from_utf8(&fieldbuf[..fieldlen])
                        .with_context(|| format!("invalid UTF-8 on line {}", line))?;
                    fieldlen = 0;

                    if first_field {
                        first_field = false;
                        match field.parse::<f64>() {
                            Ok(w) if w.is_finite() => weight = Some(w),
                            _ if field.is_empty() => {}
                            _ => record.push(rodeo.get_or_intern(field)),
                        }
                    } else if !field.is_empty() {
                        record.push(rodeo.get_or_intern(field));
                    }

                    if record_end {
                        // A blank line has neither a weight nor items.
                        if weight.is_some() || !record.is_empty() {
                            store
                                .add_weighted(&record, weight.unwrap_or(1.0))
                                .with_context(|| format!("bad transaction on line {}", line))?;
                        }
                        first_field = true;
                        weight = None;
                        record.clear();
                    }
                }
                ReadFieldResult::End => {
                    return Ok((rodeo.into_resolver(), store));
                }
            }
        }
    }
}

fn write_itemset<W: Write>(
    out: &mut W,
    resolver: &RodeoResolver<Spur>,
    itemset: &Itemset<Spur>,
    separator: &str,
) -> io::Result<()> {
    let mut items = itemset.iter();
    if let Some(item) = items.next() {
        out.write_all(resolver.resolve(&item).as_bytes())?;
    }
    for item in items {
        out.write_all(separator.as_bytes())?;
        out.write_all(resolver.resolve(&item).as_bytes())?;
    }
    Ok(())
}

/// Command-line flags take precedence over the config file.
fn apply_overrides(config: &mut MiningConfig, cli: &Cli) {
    if let Some(min_support) = cli.min_support {
        config.min_support = min_support;
    }
    if let Some(min_confidence) = cli.min_confidence {
        config.min_confidence = min_confidence;
    }
    if cli.max_size.is_some() {
        config.max_itemset_size = cli.max_size;
    }
    if cli.weighted {
        config.weighting_mode = WeightingMode::Weighted;
    }
    if cli.sequential {
        config.parallel = false;
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("cannot open config {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("cannot parse config {}", path.display()))?
        }
        None => MiningConfig::default(),
    };
    apply_overrides(&mut config, &cli);
    config.validate()?;

    let (resolver, store): (RodeoResolver<Spur>, TransactionStore<Spur>) = match &cli.input {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("cannot open input {}", path.display()))?;
            load_transactions(file)?
        }
        None => load_transactions(io::stdin().lock())?,
    };

    let result = mine(&store, &config)?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for frequent in result.iter() {
        write!(
            out,
            "{}\t{:.6}\t",
            frequent.itemset().len(),
            frequent.support().fraction
        )?;
        write_itemset(&mut out, &resolver, frequent.itemset(), "\t")?;
        writeln!(out)?;
    }

    if cli.rules {
        let rules = extract_rules(&result, config.min_confidence)?;
        for rule in rules.iter() {
            write_itemset(&mut out, &resolver, rule.antecedent(), ",")?;
            out.write_all(b" => ")?;
            write_itemset(&mut out, &resolver, rule.consequent(), ",")?;
            writeln!(
                out,
                "\t{:.6}\t{:.6}\t{:.6}",
                rule.confidence(),
                rule.lift(),
                rule.independence_alpha()
            )?;
        }
    }

    out.flush()?;
    Ok(())
}
