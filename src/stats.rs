//! Reading statistics: cumulative counters, per-day totals, streaks and achievements.
//!
//! Everything here is pure data manipulation. Persistence and remote sync live in
//! [`crate::sync`]; the clock is always passed in so the rules stay testable.

use crate::models::ReadingSession;
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Days of per-day totals kept locally.
const DAILY_RETENTION_DAYS: i64 = 366;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadingStatistics {
    /// Minutes.
    pub total_reading_time: f64,
    pub total_pages_read: u64,
    pub total_chapters_read: u64,
    /// Pages per minute.
    pub average_reading_speed: f64,
    pub reading_streak: u32,
    pub longest_streak: u32,
    pub last_read_date: Option<NaiveDate>,
    /// Minutes per week.
    pub weekly_goal: u32,
    /// Minutes per month.
    pub monthly_goal: u32,
    pub achievements: BTreeSet<String>,
}

impl Default for ReadingStatistics {
    fn default() -> Self {
        Self {
            total_reading_time: 0.0,
            total_pages_read: 0,
            total_chapters_read: 0,
            average_reading_speed: 0.0,
            reading_streak: 0,
            longest_streak: 0,
            last_read_date: None,
            weekly_goal: 60,
            monthly_goal: 240,
            achievements: BTreeSet::new(),
        }
    }
}

impl ReadingStatistics {
    /// Element-wise maximum of the cumulative counters and union of achievements.
    /// The current streak comes from whichever side read most recently, the larger
    /// one on a tie. Everything except the goals is commutative and idempotent;
    /// the goals are this device's settings and are kept from `self`.
    pub fn merge(&mut self, other: &ReadingStatistics) {
        self.total_reading_time = self.total_reading_time.max(other.total_reading_time);
        self.total_pages_read = self.total_pages_read.max(other.total_pages_read);
        self.total_chapters_read = self.total_chapters_read.max(other.total_chapters_read);
        self.longest_streak = self.longest_streak.max(other.longest_streak);
        self.achievements.extend(other.achievements.iter().cloned());

        match self.last_read_date.cmp(&other.last_read_date) {
            Ordering::Less => {
                self.last_read_date = other.last_read_date;
                self.reading_streak = other.reading_streak;
            }
            Ordering::Equal => self.reading_streak = self.reading_streak.max(other.reading_streak),
            Ordering::Greater => {}
        }

        if self.total_reading_time > 0.0 {
            self.recompute_speed();
        } else {
            self.average_reading_speed = self.average_reading_speed.max(other.average_reading_speed);
        }
    }

    pub fn merged(&self, other: &ReadingStatistics) -> ReadingStatistics {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    fn recompute_speed(&mut self) {
        if self.total_reading_time > 0.0 {
            self.average_reading_speed = self.total_pages_read as f64 / self.total_reading_time;
        }
    }

    fn advance_streak(&mut self, today: NaiveDate) {
        match self.last_read_date {
            Some(last) if last == today => {}
            Some(last) if last + Duration::days(1) == today => self.reading_streak += 1,
            _ => self.reading_streak = 1,
        }
        self.last_read_date = Some(today);
        self.longest_streak = self.longest_streak.max(self.reading_streak);
    }

    /// Streak as seen on `today`: broken once a whole day passes without reading.
    pub fn current_streak(&self, today: NaiveDate) -> u32 {
        match self.last_read_date {
            Some(last) if today - last <= Duration::days(1) => self.reading_streak,
            _ => 0,
        }
    }

    pub fn reading_level(&self) -> ReadingLevel {
        let minutes = self.total_reading_time;
        let (level, name, next) = if minutes < 60.0 {
            (1, "Người mới", Some(60))
        } else if minutes < 300.0 {
            (2, "Độc giả", Some(300))
        } else if minutes < 1000.0 {
            (3, "Mọt truyện", Some(1000))
        } else if minutes < 3000.0 {
            (4, "Chuyên gia", Some(3000))
        } else {
            (5, "Bậc thầy", None)
        };
        ReadingLevel { level, name, next }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadingLevel {
    pub level: u8,
    pub name: &'static str,
    /// Minutes needed for the next level.
    pub next: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub date: NaiveDate,
    pub reading_time: f64,
    pub pages_read: u64,
    pub chapters_read: u64,
}

impl DailyStats {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            reading_time: 0.0,
            pages_read: 0,
            chapters_read: 0,
        }
    }
}

/// Statistics plus per-day history, as stored locally and exchanged with the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StatisticsSnapshot {
    pub stats: ReadingStatistics,
    pub daily_stats: Vec<DailyStats>,
}

impl StatisticsSnapshot {
    /// Fold a finished session into the counters and return the achievements it unlocked.
    pub fn fold_session(
        &mut self,
        session: &ReadingSession,
        now: DateTime<Local>,
    ) -> Vec<&'static Achievement> {
        let today = now.date_naive();

        self.stats.total_reading_time += session.time_spent;
        self.stats.total_pages_read += u64::from(session.pages_read);
        self.stats.total_chapters_read += 1;
        self.stats.recompute_speed();

        let day = self.day_mut(today);
        day.reading_time += session.time_spent;
        day.pages_read += u64::from(session.pages_read);
        day.chapters_read += 1;

        self.stats.advance_streak(today);
        self.prune(today);

        self.unlock_achievements(session, now)
    }

    fn day_mut(&mut self, date: NaiveDate) -> &mut DailyStats {
        let index = match self.daily_stats.iter().position(|d| d.date == date) {
            Some(index) => index,
            None => {
                self.daily_stats.push(DailyStats::empty(date));
                self.daily_stats.len() - 1
            }
        };
        &mut self.daily_stats[index]
    }

    fn prune(&mut self, today: NaiveDate) {
        let cutoff = today - Duration::days(DAILY_RETENTION_DAYS);
        self.daily_stats.retain(|d| d.date > cutoff);
    }

    fn unlock_achievements(
        &mut self,
        session: &ReadingSession,
        now: DateTime<Local>,
    ) -> Vec<&'static Achievement> {
        let weekly_progress = self.weekly_progress(now.date_naive());
        let mut unlocked = Vec::new();

        for achievement in ACHIEVEMENTS {
            if self.stats.achievements.contains(achievement.id) {
                continue;
            }
            if achievement
                .requirement
                .is_met(&self.stats, session, now.hour(), weekly_progress)
            {
                self.stats.achievements.insert(achievement.id.to_string());
                unlocked.push(achievement);
            }
        }

        unlocked
    }

    pub fn merge(&mut self, remote: &StatisticsSnapshot) {
        self.stats.merge(&remote.stats);
        for remote_day in &remote.daily_stats {
            let day = self.day_mut(remote_day.date);
            day.reading_time = day.reading_time.max(remote_day.reading_time);
            day.pages_read = day.pages_read.max(remote_day.pages_read);
            day.chapters_read = day.chapters_read.max(remote_day.chapters_read);
        }
        self.daily_stats.sort_by_key(|d| d.date);
    }

    pub fn today(&self, today: NaiveDate) -> DailyStats {
        self.daily_stats
            .iter()
            .find(|d| d.date == today)
            .cloned()
            .unwrap_or_else(|| DailyStats::empty(today))
    }

    /// Minutes read in the Monday-based week containing `today`.
    pub fn week_reading_time(&self, today: NaiveDate) -> f64 {
        let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        self.daily_stats
            .iter()
            .filter(|d| d.date >= week_start && d.date <= today)
            .map(|d| d.reading_time)
            .sum()
    }

    pub fn month_reading_time(&self, today: NaiveDate) -> f64 {
        self.daily_stats
            .iter()
            .filter(|d| d.date.year() == today.year() && d.date.month() == today.month())
            .map(|d| d.reading_time)
            .sum()
    }

    pub fn weekly_progress(&self, today: NaiveDate) -> f64 {
        goal_progress(self.week_reading_time(today), self.stats.weekly_goal)
    }

    pub fn monthly_progress(&self, today: NaiveDate) -> f64 {
        goal_progress(self.month_reading_time(today), self.stats.monthly_goal)
    }

    /// The `days` most recent days, oldest first, with empty days filled in.
    pub fn last_days(&self, today: NaiveDate, days: i64) -> Vec<DailyStats> {
        (0..days)
            .rev()
            .map(|offset| self.today(today - Duration::days(offset)))
            .collect()
    }
}

fn goal_progress(minutes: f64, goal: u32) -> f64 {
    if goal == 0 {
        return 100.0;
    }
    (minutes / f64::from(goal) * 100.0).min(100.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Requirement {
    Chapters(u64),
    /// At least `pages` in a session that lasted no longer than `within_minutes`.
    Speed { pages: u32, within_minutes: f64 },
    /// Session ended at or after this hour.
    LateNight(u32),
    /// Session ended at or before this hour.
    EarlyMorning(u32),
    SessionMinutes(f64),
    WeeklyGoal,
    // Tracked by the server only.
    Genres(usize),
    Shares(u32),
    Comments(u32),
    CompletedManga(u32),
}

impl Requirement {
    fn is_met(
        &self,
        stats: &ReadingStatistics,
        session: &ReadingSession,
        hour: u32,
        weekly_progress: f64,
    ) -> bool {
        match *self {
            Requirement::Chapters(count) => stats.total_chapters_read >= count,
            Requirement::Speed {
                pages,
                within_minutes,
            } => session.pages_read >= pages && session.time_spent <= within_minutes,
            Requirement::LateNight(from) => hour >= from,
            Requirement::EarlyMorning(until) => hour <= until,
            Requirement::SessionMinutes(minutes) => session.time_spent >= minutes,
            Requirement::WeeklyGoal => weekly_progress >= 100.0,
            Requirement::Genres(_)
            | Requirement::Shares(_)
            | Requirement::Comments(_)
            | Requirement::CompletedManga(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Achievement {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
    pub requirement: Requirement,
    pub reward: &'static str,
}

pub static ACHIEVEMENTS: &[Achievement] = &[
    Achievement {
        id: "first_chapter",
        name: "Chương đầu tiên",
        description: "Đọc chương đầu tiên",
        icon: "📖",
        requirement: Requirement::Chapters(1),
        reward: "Huy hiệu người mới",
    },
    Achievement {
        id: "speed_reader",
        name: "Tốc độ ánh sáng",
        description: "Đọc 50 trang trong 1 giờ",
        icon: "⚡",
        requirement: Requirement::Speed {
            pages: 50,
            within_minutes: 60.0,
        },
        reward: "100 điểm kinh nghiệm",
    },
    Achievement {
        id: "night_owl",
        name: "Cú đêm",
        description: "Đọc truyện sau 11h đêm",
        icon: "🦉",
        requirement: Requirement::LateNight(23),
        reward: "Chế độ đêm đặc biệt",
    },
    Achievement {
        id: "genre_explorer",
        name: "Thám hiểm thể loại",
        description: "Đọc ít nhất 5 thể loại khác nhau",
        icon: "🗺️",
        requirement: Requirement::Genres(5),
        reward: "Gợi ý cá nhân hóa",
    },
    Achievement {
        id: "weekly_warrior",
        name: "Chiến binh tuần",
        description: "Đạt mục tiêu đọc hàng tuần",
        icon: "🏆",
        requirement: Requirement::WeeklyGoal,
        reward: "Huy hiệu tuần",
    },
    Achievement {
        id: "binge_reader",
        name: "Cày truyện",
        description: "Đọc liên tục 3 giờ",
        icon: "📚",
        requirement: Requirement::SessionMinutes(180.0),
        reward: "Danh hiệu cày truyện",
    },
    Achievement {
        id: "early_bird",
        name: "Chim sớm",
        description: "Đọc truyện trước 7h sáng",
        icon: "🌅",
        requirement: Requirement::EarlyMorning(7),
        reward: "Chế độ sáng đặc biệt",
    },
    Achievement {
        id: "social_butterfly",
        name: "Bướm xã hội",
        description: "Chia sẻ 10 bộ truyện",
        icon: "🦋",
        requirement: Requirement::Shares(10),
        reward: "Huy hiệu chia sẻ",
    },
    Achievement {
        id: "reviewer",
        name: "Nhà phê bình",
        description: "Viết 20 bình luận",
        icon: "✍️",
        requirement: Requirement::Comments(20),
        reward: "Huy hiệu phê bình",
    },
    Achievement {
        id: "completionist",
        name: "Người hoàn thành",
        description: "Đọc xong 10 bộ truyện",
        icon: "🎯",
        requirement: Requirement::CompletedManga(10),
        reward: "Danh hiệu hoàn thành",
    },
];

pub fn find_achievement(id: &str) -> Option<&'static Achievement> {
    ACHIEVEMENTS.iter().find(|a| a.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, hour, 0, 0).unwrap()
    }

    fn session(pages: u32, minutes: f64) -> ReadingSession {
        let mut session = ReadingSession::start("m1", "c1");
        session.pages_read = pages;
        session.time_spent = minutes;
        session
    }

    fn stats_with(time: f64, achievements: &[&str]) -> ReadingStatistics {
        ReadingStatistics {
            total_reading_time: time,
            achievements: achievements.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_is_commutative() {
        let local = stats_with(100.0, &["a", "b"]);
        let remote = stats_with(80.0, &["b", "c"]);

        let left = local.merged(&remote);
        let right = remote.merged(&local);

        assert_eq!(left.total_reading_time, 100.0);
        assert_eq!(right.total_reading_time, 100.0);
        let expected: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(left.achievements, expected);
        assert_eq!(right.achievements, expected);
    }

    #[test]
    fn test_merge_takes_streak_from_latest_reader() {
        let mut local = stats_with(30.0, &[]);
        local.reading_streak = 7;
        local.last_read_date = NaiveDate::from_ymd_opt(2026, 5, 1);
        let mut remote = stats_with(40.0, &[]);
        remote.reading_streak = 2;
        remote.last_read_date = NaiveDate::from_ymd_opt(2026, 5, 3);

        let left = local.merged(&remote);
        let right = remote.merged(&local);
        assert_eq!(left, right);
        assert_eq!(left.reading_streak, 2);
        assert_eq!(left.last_read_date, NaiveDate::from_ymd_opt(2026, 5, 3));

        remote.last_read_date = local.last_read_date;
        assert_eq!(local.merged(&remote).reading_streak, 7);
        assert_eq!(remote.merged(&local).reading_streak, 7);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut local = stats_with(42.0, &["first_chapter"]);
        local.total_pages_read = 30;
        let once = local.merged(&local);
        assert_eq!(once, local.merged(&once));
        assert_eq!(once.total_pages_read, 30);
    }

    #[test]
    fn test_fold_session_updates_counters_and_day() {
        let mut snapshot = StatisticsSnapshot::default();
        let unlocked = snapshot.fold_session(&session(20, 10.0), at(2026, 3, 4, 15));

        assert_eq!(snapshot.stats.total_chapters_read, 1);
        assert_eq!(snapshot.stats.total_pages_read, 20);
        assert_eq!(snapshot.stats.average_reading_speed, 2.0);
        assert_eq!(snapshot.daily_stats.len(), 1);
        assert_eq!(snapshot.daily_stats[0].pages_read, 20);
        assert!(unlocked.iter().any(|a| a.id == "first_chapter"));
    }

    #[test]
    fn test_achievements_only_grow() {
        let mut snapshot = StatisticsSnapshot::default();
        snapshot.fold_session(&session(5, 1.0), at(2026, 3, 4, 15));
        let again = snapshot.fold_session(&session(5, 1.0), at(2026, 3, 4, 16));
        assert!(again.iter().all(|a| a.id != "first_chapter"));
        assert!(snapshot.stats.achievements.contains("first_chapter"));
    }

    #[test]
    fn test_time_of_day_achievements() {
        let mut snapshot = StatisticsSnapshot::default();
        let late = snapshot.fold_session(&session(3, 2.0), at(2026, 3, 4, 23));
        assert!(late.iter().any(|a| a.id == "night_owl"));
        assert!(!snapshot.stats.achievements.contains("early_bird"));

        let early = snapshot.fold_session(&session(3, 2.0), at(2026, 3, 5, 6));
        assert!(early.iter().any(|a| a.id == "early_bird"));
    }

    #[test]
    fn test_speed_and_binge() {
        let mut snapshot = StatisticsSnapshot::default();
        let fast = snapshot.fold_session(&session(60, 45.0), at(2026, 3, 4, 12));
        assert!(fast.iter().any(|a| a.id == "speed_reader"));

        let long = snapshot.fold_session(&session(10, 200.0), at(2026, 3, 4, 12));
        assert!(long.iter().any(|a| a.id == "binge_reader"));
    }

    #[test]
    fn test_server_only_achievements_never_unlock_locally() {
        let mut snapshot = StatisticsSnapshot::default();
        snapshot.fold_session(&session(500, 300.0), at(2026, 3, 4, 12));
        for id in ["genre_explorer", "social_butterfly", "reviewer", "completionist"] {
            assert!(!snapshot.stats.achievements.contains(id));
        }
    }

    #[test]
    fn test_streak_counts_consecutive_days() {
        let mut snapshot = StatisticsSnapshot::default();
        snapshot.fold_session(&session(1, 1.0), at(2026, 3, 1, 12));
        snapshot.fold_session(&session(1, 1.0), at(2026, 3, 1, 18));
        snapshot.fold_session(&session(1, 1.0), at(2026, 3, 2, 12));
        snapshot.fold_session(&session(1, 1.0), at(2026, 3, 3, 12));
        assert_eq!(snapshot.stats.reading_streak, 3);

        snapshot.fold_session(&session(1, 1.0), at(2026, 3, 6, 12));
        assert_eq!(snapshot.stats.reading_streak, 1);
        assert_eq!(snapshot.stats.longest_streak, 3);
    }

    #[test]
    fn test_current_streak_breaks_after_missed_day() {
        let mut snapshot = StatisticsSnapshot::default();
        snapshot.fold_session(&session(1, 1.0), at(2026, 3, 1, 12));
        let d = |day| NaiveDate::from_ymd_opt(2026, 3, day).unwrap();
        assert_eq!(snapshot.stats.current_streak(d(2)), 1);
        assert_eq!(snapshot.stats.current_streak(d(3)), 0);
    }

    #[test]
    fn test_weekly_goal_progress() {
        let mut snapshot = StatisticsSnapshot::default();
        // 2026-03-02 is a Monday.
        snapshot.fold_session(&session(10, 30.0), at(2026, 3, 2, 12));
        let wednesday = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        assert_eq!(snapshot.weekly_progress(wednesday), 50.0);

        let unlocked = snapshot.fold_session(&session(10, 40.0), at(2026, 3, 4, 12));
        assert_eq!(snapshot.weekly_progress(wednesday), 100.0);
        assert!(unlocked.iter().any(|a| a.id == "weekly_warrior"));

        let next_monday = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert_eq!(snapshot.week_reading_time(next_monday), 0.0);
    }

    #[test]
    fn test_reading_level_ladder() {
        assert_eq!(stats_with(10.0, &[]).reading_level().level, 1);
        assert_eq!(stats_with(300.0, &[]).reading_level().name, "Mọt truyện");
        assert_eq!(stats_with(5000.0, &[]).reading_level().next, None);
    }

    #[test]
    fn test_last_days_fills_gaps() {
        let mut snapshot = StatisticsSnapshot::default();
        snapshot.fold_session(&session(4, 2.0), at(2026, 3, 2, 12));
        let days = snapshot.last_days(NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(), 7);
        assert_eq!(days.len(), 7);
        assert_eq!(days[4].pages_read, 4);
        assert_eq!(days[6].pages_read, 0);
    }
}
