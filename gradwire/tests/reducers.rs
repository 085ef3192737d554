mod reducers {
    pub mod helpers;

    mod collectives;
    mod embedding;
    mod exact;
    mod low_rank;
    mod sign;
    mod single_worker;
    mod sparse;
    mod svd;
    mod topk;
}
