mod ordering;
mod round_trip;
mod timeout;
