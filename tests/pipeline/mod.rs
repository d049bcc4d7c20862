mod backfill;
mod live;
mod resync;
mod runner;
