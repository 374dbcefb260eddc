/// 计数器原语
///
/// 提供统计模块使用的两种计数器：普通计数器和按天分桶的滚动计数器。
/// 滚动计数器只保留最近 7 天的数据，旧桶在每次访问时被惰性淘汰。
use chrono::{Duration as ChronoDuration, NaiveDate};
use std::collections::VecDeque;

/// 滚动计数器保留的天数
pub const RESERVE_DAYS: usize = 7;

/// 普通计数器，减到 0 为止不会变为负数
#[derive(Debug, Clone, Default)]
pub struct Counter {
    count: i64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&mut self, n: i64) {
        self.count += n;
    }

    /// 递减，饱和于 0
    pub fn dec(&mut self, n: i64) {
        self.count = (self.count - n).max(0);
    }

    pub fn count(&self) -> i64 {
        self.count
    }
}

/// 单日桶
#[derive(Debug, Clone)]
struct DayBucket {
    date: NaiveDate,
    count: i64,
}

/// 按天分桶的滚动计数器
///
/// 队首是最新的一天。所有读写都以调用方传入的日期为"今天"，
/// 跨天时自动补齐中间的空桶并截断到保留天数。
#[derive(Debug, Clone)]
pub struct DateCounter {
    reserve_days: usize,
    buckets: VecDeque<DayBucket>,
}

impl DateCounter {
    pub fn new(reserve_days: usize) -> Self {
        Self {
            reserve_days: reserve_days.max(1),
            buckets: VecDeque::new(),
        }
    }

    /// 淘汰过期桶并确保队首是 today
    fn rotate(&mut self, today: NaiveDate) {
        if self.buckets.is_empty() {
            self.buckets.push_front(DayBucket {
                date: today,
                count: 0,
            });
            return;
        }

        let newest = self.buckets.front().expect("buckets not empty").date;
        let mut day = newest;
        while day < today {
            day = day + ChronoDuration::days(1);
            self.buckets.push_front(DayBucket {
                date: day,
                count: 0,
            });
        }
        self.buckets.truncate(self.reserve_days);
    }

    /// 在指定日期的桶上累加
    pub fn inc_on(&mut self, today: NaiveDate, n: i64) {
        self.rotate(today);
        if let Some(front) = self.buckets.front_mut() {
            front.count += n;
        }
    }

    /// 今天的计数
    pub fn today_count(&mut self, today: NaiveDate) -> i64 {
        self.rotate(today);
        self.buckets.front().map(|b| b.count).unwrap_or(0)
    }

    /// 最近 N 天的计数，从新到旧，不足的天数补 0
    pub fn last_days(&mut self, today: NaiveDate) -> Vec<i64> {
        self.rotate(today);
        let mut out: Vec<i64> = self.buckets.iter().map(|b| b.count).collect();
        out.resize(self.reserve_days, 0);
        out
    }

    /// 保留窗口内的总量
    pub fn total(&self) -> i64 {
        self.buckets.iter().map(|b| b.count).sum()
    }
}

impl Default for DateCounter {
    fn default() -> Self {
        Self::new(RESERVE_DAYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_counter_saturates_at_zero() {
        let mut c = Counter::new();
        c.inc(2);
        c.dec(1);
        assert_eq!(c.count(), 1);
        c.dec(5);
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn test_date_counter_same_day() {
        let today = date(2024, 3, 10);
        let mut dc = DateCounter::default();
        dc.inc_on(today, 100);
        dc.inc_on(today, 50);
        assert_eq!(dc.today_count(today), 150);
        assert_eq!(dc.total(), 150);
    }

    #[test]
    fn test_date_counter_rolls_over_midnight() {
        let yesterday = date(2024, 3, 9);
        let today = date(2024, 3, 10);
        let mut dc = DateCounter::default();

        // 23:59:59 写入 100，00:00:01 写入 200
        dc.inc_on(yesterday, 100);
        dc.inc_on(today, 200);

        let days = dc.last_days(today);
        assert_eq!(days.len(), RESERVE_DAYS);
        assert_eq!(days[0], 200);
        assert_eq!(days[1], 100);
        assert!(days[2..].iter().all(|&v| v == 0));
        assert_eq!(dc.total(), 300);
    }

    #[test]
    fn test_date_counter_keeps_exactly_reserve_days() {
        let start = date(2024, 1, 1);
        let mut dc = DateCounter::default();
        for i in 0..10 {
            dc.inc_on(start + ChronoDuration::days(i), 1);
        }
        let today = start + ChronoDuration::days(9);
        let days = dc.last_days(today);
        assert_eq!(days.len(), RESERVE_DAYS);
        assert!(days.iter().all(|&v| v == 1));
        assert_eq!(dc.total(), RESERVE_DAYS as i64);
    }

    #[test]
    fn test_date_counter_gap_fills_empty_buckets() {
        let mut dc = DateCounter::default();
        dc.inc_on(date(2024, 5, 1), 7);
        // 三天没有流量后查询
        let days = dc.last_days(date(2024, 5, 4));
        assert_eq!(days[0], 0);
        assert_eq!(days[1], 0);
        assert_eq!(days[2], 0);
        assert_eq!(days[3], 7);
    }
}
