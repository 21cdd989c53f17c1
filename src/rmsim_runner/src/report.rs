//! Console output
use itertools::Itertools;
use rmsim_kernel::{AnalysisReport, Reporter, RunReport};
use std::{fmt, time::Duration};

/// Prints the analysis and the run results to the standard output.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn analysis(&mut self, report: &AnalysisReport) {
        print!("{}", AnalysisTable(report));
    }

    fn run_finished(&mut self, report: &RunReport) {
        print!("{}", RunSummary(report));
    }
}

struct Ms(Duration);

impl fmt::Display for Ms {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.3}ms", self.0.as_secs_f64() * 1000.0)
    }
}

/// Formats an [`AnalysisReport`] as a table.
pub struct AnalysisTable<'a>(pub &'a AnalysisReport);

impl fmt::Display for AnalysisTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let verdict = &self.0.verdict;

        writeln!(
            f,
            "{:>4} {:>8} {:>12} {:>12} {:>12} {:>10} {:>10}",
            "task", "priority", "period", "WCET", "blocking", "U_i", "Ulub_i"
        )?;
        for (i, task) in self.0.tasks.iter().enumerate() {
            write!(
                f,
                "{:>4} {:>8} {:>12} {:>12} {:>12}",
                task.id,
                task.priority,
                Ms(task.period).to_string(),
                Ms(task.wcet).to_string(),
                Ms(task.blocking).to_string(),
            )?;
            // Rows after a failing task are not evaluated
            match verdict.rows.get(i) {
                Some(row) => {
                    write!(f, " {:>10.6} {:>10.6}", row.utilization, row.bound)?;
                    if let Some(r) = row.response_time {
                        write!(f, "  R = {}", Ms(r))?;
                    }
                    if !row.ok {
                        f.write_str("  <- fails")?;
                    }
                }
                None => write!(f, " {:>10} {:>10}", "-", "-")?,
            }
            writeln!(f)?;
        }

        writeln!(
            f,
            "{}: U = {:.6}, Ulub = {:.6} -> {}",
            verdict.policy,
            verdict.utilization,
            verdict.bound,
            if verdict.schedulable {
                "schedulable"
            } else {
                "not schedulable"
            }
        )
    }
}

/// Formats a [`RunReport`].
pub struct RunSummary<'a>(pub &'a RunReport);

impl fmt::Display for RunSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for task in &self.0.tasks {
            writeln!(
                f,
                "task {}: {} job(s), {} missed deadline(s), longest blocking {}",
                task.id,
                task.completed_iterations,
                task.missed_deadlines,
                Ms(task.max_blocked),
            )?;
        }
        writeln!(
            f,
            "missed deadlines: [{}]",
            self.0.tasks.iter().map(|t| t.missed_deadlines).format(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmsim_kernel::{
        analysis::{analyze, AnalysisPolicy, TaskTiming},
        boot::TaskAnalysis,
        Priority, TaskId, TaskReport, Time,
    };

    fn ms(x: u64) -> Duration {
        Duration::from_millis(x)
    }

    #[test]
    fn analysis_table() {
        let tasks = vec![
            TaskAnalysis {
                id: TaskId(1),
                priority: Priority(0),
                period: ms(10),
                wcet: ms(2),
                blocking: ms(15),
            },
            TaskAnalysis {
                id: TaskId(2),
                priority: Priority(1),
                period: ms(20),
                wcet: ms(2),
                blocking: ms(0),
            },
        ];
        let timings: Vec<_> = tasks
            .iter()
            .map(|t| TaskTiming {
                id: t.id,
                period: t.period,
                wcet: t.wcet,
                blocking: t.blocking,
            })
            .collect();
        let report = AnalysisReport {
            verdict: analyze(&timings, AnalysisPolicy::BlockingAware),
            tasks,
        };

        let text = AnalysisTable(&report).to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4, "{}", text);
        assert!(lines[1].contains("15.000ms"), "{}", lines[1]);
        assert!(lines[1].ends_with("<- fails"), "{}", lines[1]);
        assert!(lines[2].ends_with('-'), "{}", lines[2]);
        assert!(lines[3].ends_with("not schedulable"), "{}", lines[3]);
    }

    #[test]
    fn run_summary() {
        let report = RunReport {
            tasks: (1..=3)
                .map(|i| TaskReport {
                    id: TaskId(i),
                    priority: Priority(i - 1),
                    wcet: ms(1),
                    missed_deadlines: (i as u32 - 1) * 2,
                    completed_iterations: 100,
                    max_blocked: Duration::from_micros(1500),
                    next_arrival: Time::ZERO,
                })
                .collect(),
        };
        let text = RunSummary(&report).to_string();
        assert!(text.contains("task 2: 100 job(s), 2 missed deadline(s), longest blocking 1.500ms"));
        assert!(text.ends_with("missed deadlines: [0, 2, 4]\n"));
    }
}
